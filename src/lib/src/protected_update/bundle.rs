//! Update delivery formats
//!
//! - [`UpdatePackage`]: CBOR `{manifest: bstr, fragments: [bstr]}` on the
//!   `protected_update` channel.
//! - [`JsonBundle`]: the bootstrap bundle on the `trust_anchor` channel, a
//!   flat JSON object whose binary fields are standard base64:
//!
//! ```json
//! {
//!   "signing_certificate": "MIIB...",
//!   "manifest": "omRib2R5...",
//!   "fragment_count": 2,
//!   "fragment_0": "...",
//!   "fragment_1": "..."
//! }
//! ```

use crate::error::SeError;
use crate::protected_update::manifest::{MAX_FRAGMENTS, MAX_FRAGMENT_LEN, MAX_MANIFEST_LEN};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::{Map, Value};

/// Largest bootstrap bundle accepted.
pub const MAX_BUNDLE_LEN: usize = 128 * 1024;
/// Largest signing certificate in a bundle.
pub const MAX_SIGNING_CERT_LEN: usize = 1200;

/// A manifest and its fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub manifest: ByteBuf,
    pub fragments: Vec<ByteBuf>,
}

impl UpdatePackage {
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, SeError> {
        let package: UpdatePackage = serde_cbor::from_slice(bytes)?;
        package.check_limits()?;
        Ok(package)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, SeError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn check_limits(&self) -> Result<(), SeError> {
        if self.manifest.len() > MAX_MANIFEST_LEN {
            return Err(SeError::InvalidParam(format!(
                "manifest is {} bytes, limit is {}",
                self.manifest.len(),
                MAX_MANIFEST_LEN
            )));
        }
        if self.fragments.is_empty() || self.fragments.len() > MAX_FRAGMENTS {
            return Err(SeError::InvalidParam(format!(
                "fragment count {} outside 1..={}",
                self.fragments.len(),
                MAX_FRAGMENTS
            )));
        }
        if let Some((i, f)) = self
            .fragments
            .iter()
            .enumerate()
            .find(|(_, f)| f.len() > MAX_FRAGMENT_LEN)
        {
            return Err(SeError::InvalidParam(format!(
                "fragment {} is {} bytes, limit is {}",
                i,
                f.len(),
                MAX_FRAGMENT_LEN
            )));
        }
        Ok(())
    }
}

/// Bootstrap bundle: the trust anchor certificate plus a first update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonBundle {
    /// DER certificate (or SPKI) of the manifest signer
    pub signing_certificate: Vec<u8>,
    pub package: UpdatePackage,
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a Value, SeError> {
    object
        .get(name)
        .ok_or_else(|| SeError::Parse(format!("bundle is missing {}", name)))
}

fn base64_field(object: &Map<String, Value>, name: &str) -> Result<Vec<u8>, SeError> {
    let text = field(object, name)?
        .as_str()
        .ok_or_else(|| SeError::Parse(format!("bundle field {} is not a string", name)))?;
    Ok(BASE64_STANDARD.decode(text)?)
}

impl JsonBundle {
    pub fn parse(bytes: &[u8]) -> Result<Self, SeError> {
        if bytes.len() > MAX_BUNDLE_LEN {
            return Err(SeError::InvalidParam(format!(
                "bundle is {} bytes, limit is {}",
                bytes.len(),
                MAX_BUNDLE_LEN
            )));
        }
        let object: Map<String, Value> = serde_json::from_slice(bytes)?;

        let signing_certificate = base64_field(&object, "signing_certificate")?;
        if signing_certificate.is_empty() || signing_certificate.len() > MAX_SIGNING_CERT_LEN {
            return Err(SeError::InvalidParam(format!(
                "signing certificate of {} bytes",
                signing_certificate.len()
            )));
        }
        let manifest = base64_field(&object, "manifest")?;

        let count = field(&object, "fragment_count")?
            .as_u64()
            .ok_or_else(|| SeError::Parse("fragment_count is not a number".to_string()))?;
        if count == 0 || count as usize > MAX_FRAGMENTS {
            return Err(SeError::InvalidParam(format!(
                "fragment count {} outside 1..={}",
                count, MAX_FRAGMENTS
            )));
        }
        let fragments = (0..count)
            .map(|i| base64_field(&object, &format!("fragment_{}", i)).map(ByteBuf::from))
            .collect::<Result<Vec<_>, _>>()?;

        let package = UpdatePackage {
            manifest: ByteBuf::from(manifest),
            fragments,
        };
        package.check_limits()?;
        Ok(Self {
            signing_certificate,
            package,
        })
    }

    pub fn to_json(&self) -> Result<String, SeError> {
        let mut object = Map::new();
        object.insert(
            "signing_certificate".to_string(),
            Value::String(BASE64_STANDARD.encode(&self.signing_certificate)),
        );
        object.insert(
            "manifest".to_string(),
            Value::String(BASE64_STANDARD.encode(&self.package.manifest)),
        );
        object.insert(
            "fragment_count".to_string(),
            Value::from(self.package.fragments.len()),
        );
        for (i, fragment) in self.package.fragments.iter().enumerate() {
            object.insert(
                format!("fragment_{}", i),
                Value::String(BASE64_STANDARD.encode(fragment)),
            );
        }
        Ok(serde_json::to_string(&object)?)
    }
}
