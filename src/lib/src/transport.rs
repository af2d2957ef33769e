//! Message transport boundary
//!
//! Workflows talk to the backend through the [`Transport`] trait: a
//! connection plus named channels carrying opaque byte payloads. The wire
//! protocol (MQTT, HTTPS, ...) and its TLS setup live behind the trait.
//!
//! [`LoopbackTransport`] is an in-process broker used by tests and by the
//! command-line emulator. It never blocks: a `receive` on an empty channel
//! reports a timeout immediately.

use crate::error::SeError;
use crate::identity::DeviceIdentity;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Byte-oriented publish/receive connection.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), SeError>;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), SeError>;

    /// Wait up to `timeout` for the next message on `channel`.
    ///
    /// `Ok(None)` means the wait expired.
    fn receive(&mut self, channel: &str, timeout: Duration) -> Result<Option<Vec<u8>>, SeError>;
}

/// Channel names for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    /// Device → backend: PEM certificate signing request
    pub csr: String,
    /// Backend → device: issued certificate (PEM or DER)
    pub certificate: String,
    /// Backend → device: CBOR update package
    pub protected_update: String,
    /// Backend → device: JSON bootstrap bundle
    pub trust_anchor: String,
    /// Device → backend: status reports
    pub status: String,
    /// Device → backend: protected update outcome
    pub ack: String,
}

impl Channels {
    pub fn for_identity(identity: &DeviceIdentity) -> Self {
        let base = format!("device/{}", identity.to_hex());
        Self {
            csr: format!("{}/commands/csr", base),
            certificate: format!("{}/commands/certificate", base),
            protected_update: format!("{}/commands/protected_update", base),
            trust_anchor: format!("{}/commands/trust_anchor", base),
            status: format!("{}/status", base),
            ack: format!("{}/commands/protected_update/ack", base),
        }
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<(String, Vec<u8>)> + Send>;

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    connect_failures: u32,
    publish_failures: u32,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    published: Vec<(String, Vec<u8>)>,
    responders: HashMap<String, Responder>,
}

/// In-process transport.
///
/// Clones share one broker, so a test can keep a handle to play the backend
/// while the workflow owns another.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoopbackState>, SeError> {
        self.state
            .lock()
            .map_err(|e| SeError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) -> Result<(), SeError> {
        self.lock()?.connect_failures = count;
        Ok(())
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) -> Result<(), SeError> {
        self.lock()?.publish_failures = count;
        Ok(())
    }

    /// Queue a message for the device on `channel`.
    pub fn push(&self, channel: &str, payload: Vec<u8>) -> Result<(), SeError> {
        self.lock()?
            .queues
            .entry(channel.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    /// Answer every publish on `channel` with `responder`.
    ///
    /// A returned `(channel, payload)` is queued for the device. The
    /// responder runs under the broker lock and must not use the transport.
    pub fn respond_on<F>(&self, channel: &str, responder: F) -> Result<(), SeError>
    where
        F: FnMut(&[u8]) -> Option<(String, Vec<u8>)> + Send + 'static,
    {
        self.lock()?
            .responders
            .insert(channel.to_string(), Box::new(responder));
        Ok(())
    }

    /// Everything the device published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Result<Vec<Vec<u8>>, SeError> {
        Ok(self
            .lock()?
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect())
    }

    pub fn disconnect(&self) -> Result<(), SeError> {
        self.lock()?.connected = false;
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self) -> Result<(), SeError> {
        let mut state = self.lock()?;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(SeError::Transport("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), SeError> {
        let mut state = self.lock()?;
        if !state.connected {
            return Err(SeError::Transport("not connected".to_string()));
        }
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(SeError::Transport("publish failed".to_string()));
        }
        state.published.push((channel.to_string(), payload.to_vec()));

        let reply = match state.responders.get_mut(channel) {
            Some(responder) => responder(payload),
            None => None,
        };
        if let Some((reply_channel, reply)) = reply {
            state.queues.entry(reply_channel).or_default().push_back(reply);
        }
        Ok(())
    }

    fn receive(&mut self, channel: &str, _timeout: Duration) -> Result<Option<Vec<u8>>, SeError> {
        let mut state = self.lock()?;
        if !state.connected {
            return Err(SeError::Transport("not connected".to_string()));
        }
        Ok(state.queues.get_mut(channel).and_then(|q| q.pop_front()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::UID_LEN;

    #[test]
    fn test_channel_names() {
        let id = DeviceIdentity::from_uid(&[0xAB; UID_LEN]).unwrap();
        let ch = Channels::for_identity(&id);
        let hex = "AB".repeat(UID_LEN);
        assert_eq!(ch.csr, format!("device/{}/commands/csr", hex));
        assert_eq!(ch.certificate, format!("device/{}/commands/certificate", hex));
        assert_eq!(
            ch.protected_update,
            format!("device/{}/commands/protected_update", hex)
        );
        assert!(ch.ack.ends_with("/ack"));
    }

    #[test]
    fn test_loopback_roundtrip() {
        let backend = LoopbackTransport::new();
        let mut device = backend.clone();

        assert!(device.publish("a", b"x").is_err());
        backend.fail_next_connects(1).unwrap();
        assert!(device.connect().is_err());
        device.connect().unwrap();
        assert!(backend.is_connected());

        backend
            .respond_on("req", |payload| Some(("resp".to_string(), payload.to_ascii_uppercase())))
            .unwrap();
        device.publish("req", b"ping").unwrap();
        assert_eq!(backend.published("req").unwrap(), vec![b"ping".to_vec()]);
        assert_eq!(
            device.receive("resp", Duration::from_secs(1)).unwrap(),
            Some(b"PING".to_vec())
        );
        assert_eq!(device.receive("resp", Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_scripted_publish_failure() {
        let mut device = LoopbackTransport::new();
        device.connect().unwrap();
        device.fail_next_publishes(2).unwrap();
        assert!(matches!(device.publish("c", b"1"), Err(SeError::Transport(_))));
        assert!(device.publish("c", b"2").is_err());
        device.publish("c", b"3").unwrap();
        assert_eq!(device.published("c").unwrap(), vec![b"3".to_vec()]);
    }
}
