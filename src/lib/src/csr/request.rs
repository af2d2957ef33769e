/// Certificate Signing Request (CSR) generation
///
/// Builds a PKCS#10 request for a key held in the secure element. The
/// request info is hashed and signed inside the element, so the private key
/// never leaves it.
///
/// ```text
/// CertificationRequest ::= SEQUENCE {
///   certificationRequestInfo CertificationRequestInfo,
///   signatureAlgorithm AlgorithmIdentifier,
///   signature BIT STRING
/// }
/// ```

use crate::error::SeError;
use crate::facade::FacadeGuard;
use crate::identity::DeviceIdentity;
use crate::platform::VerifyingKey;
use crate::slots::KeySlot;
use p256::pkcs8::EncodePublicKey;

/// Largest CSR the backend accepts.
pub const MAX_CSR_LEN: usize = 1024;

/// A signed PKCS#10 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    common_name: String,
    public_key: VerifyingKey,
}

impl CertificateRequest {
    /// Build and sign a request for the key in `slot`.
    ///
    /// Subject is `CN=<identity>` plus `O=<organization>` when given.
    pub fn build(
        se: &mut FacadeGuard<'_>,
        slot: KeySlot,
        identity: &DeviceIdentity,
        organization: Option<&str>,
    ) -> Result<Self, SeError> {
        let public_key = se.public_key(slot)?;
        let common_name = identity.common_name();

        let info = Self::build_info(&common_name, organization, &public_key)?;
        let digest = se.sha256(&info)?;
        let signature = se.sign(slot, &digest)?;

        let mut body = info;
        body.extend_from_slice(&der_encode::ecdsa_with_sha256());
        body.extend_from_slice(&der_encode::encode_bit_string(signature.to_der().as_bytes()));
        let der = der_encode::encode_sequence(&body);

        if der.len() > MAX_CSR_LEN {
            return Err(SeError::InvalidParam(format!(
                "CSR is {} bytes, limit is {}",
                der.len(),
                MAX_CSR_LEN
            )));
        }
        Ok(Self {
            der,
            common_name,
            public_key,
        })
    }

    /// CertificationRequestInfo ::= SEQUENCE {
    ///   version INTEGER { v1(0) },
    ///   subject Name,
    ///   subjectPKInfo SubjectPublicKeyInfo,
    ///   attributes [0] Attributes
    /// }
    fn build_info(
        common_name: &str,
        organization: Option<&str>,
        public_key: &VerifyingKey,
    ) -> Result<Vec<u8>, SeError> {
        use der_encode::*;

        let mut info = Vec::new();
        info.extend_from_slice(&encode_integer(&[0]));
        info.extend_from_slice(&Self::build_subject(common_name, organization));

        let spki = public_key
            .to_public_key_der()
            .map_err(|e| SeError::Internal(format!("SPKI encoding failed: {}", e)))?;
        info.extend_from_slice(spki.as_bytes());

        // attributes: [0] empty
        info.extend_from_slice(&[0xA0, 0x00]);
        Ok(encode_sequence(&info))
    }

    /// Name ::= SEQUENCE OF SET OF AttributeTypeAndValue
    fn build_subject(common_name: &str, organization: Option<&str>) -> Vec<u8> {
        use der_encode::*;

        let mut rdns = Vec::new();
        rdns.extend_from_slice(&encode_set(&encode_attribute_type_and_value(OID_CN, common_name)));
        if let Some(org) = organization {
            rdns.extend_from_slice(&encode_set(&encode_attribute_type_and_value(OID_O, org)));
        }
        encode_sequence(&rdns)
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", self.der.clone()))
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }
}

/// Minimal DER writers for the fixed CSR layout.
mod der_encode {
    /// 2.5.4.3
    pub const OID_CN: &[u8] = &[0x55, 0x04, 0x03];
    /// 2.5.4.10
    pub const OID_O: &[u8] = &[0x55, 0x04, 0x0A];
    /// 1.2.840.10045.4.3.2
    const OID_ECDSA_WITH_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];

    pub fn encode_integer(value: &[u8]) -> Vec<u8> {
        encode_tlv(0x02, value)
    }

    pub fn encode_sequence(contents: &[u8]) -> Vec<u8> {
        encode_tlv(0x30, contents)
    }

    pub fn encode_set(contents: &[u8]) -> Vec<u8> {
        encode_tlv(0x31, contents)
    }

    /// BIT STRING with zero unused bits.
    pub fn encode_bit_string(contents: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(contents.len() + 1);
        body.push(0x00);
        body.extend_from_slice(contents);
        encode_tlv(0x03, &body)
    }

    pub fn ecdsa_with_sha256() -> Vec<u8> {
        encode_sequence(&encode_tlv(0x06, OID_ECDSA_WITH_SHA256))
    }

    pub fn encode_attribute_type_and_value(oid: &[u8], value: &str) -> Vec<u8> {
        let mut attr = encode_tlv(0x06, oid);
        // UTF8String
        attr.extend_from_slice(&encode_tlv(0x0C, value.as_bytes()));
        encode_sequence(&attr)
    }

    fn encode_tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        encode_length(&mut out, contents.len());
        out.extend_from_slice(contents);
        out
    }

    pub fn encode_length(output: &mut Vec<u8>, length: usize) {
        if length < 128 {
            output.push(length as u8);
        } else if length < 256 {
            output.push(0x81);
            output.push(length as u8);
        } else {
            output.push(0x82);
            output.push((length >> 8) as u8);
            output.push((length & 0xFF) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::SecureElementFacade;
    use crate::platform::software::SoftwareSecureElement;
    use crate::platform::UID_LEN;
    use crate::slots::SlotMap;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::Signature;
    use sha2::{Digest, Sha256};
    use x509_parser::prelude::FromDer;

    fn facade() -> SecureElementFacade {
        let se = SoftwareSecureElement::with_uid(&[0x42; UID_LEN]).expect("Failed to create element");
        SecureElementFacade::new(Box::new(se), SlotMap::default()).expect("Failed to create facade")
    }

    #[test]
    fn test_csr_parses_and_verifies() {
        let facade = facade();
        let mut se = facade.acquire().unwrap();
        let public = se.generate_keypair(KeySlot::IDENTITY_KEY).unwrap();
        let identity = DeviceIdentity::from_uid(&[0x42; UID_LEN]).unwrap();

        let csr = CertificateRequest::build(&mut se, KeySlot::IDENTITY_KEY, &identity, Some("Example"))
            .unwrap();
        assert!(csr.to_der().len() <= MAX_CSR_LEN);
        assert_eq!(csr.public_key(), &public);

        let (rest, parsed) =
            x509_parser::certification_request::X509CertificationRequest::from_der(csr.to_der())
                .unwrap();
        assert!(rest.is_empty());
        let info = &parsed.certification_request_info;
        let cn = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, identity.to_hex());
        assert_eq!(
            info.subject_pki.subject_public_key.data.as_ref(),
            public.to_encoded_point(false).as_bytes()
        );

        let digest = Sha256::digest(info.raw);
        let signature = Signature::from_der(&parsed.signature_value.data).unwrap();
        assert!(public.verify_prehash(&digest, &signature).is_ok());
    }

    #[test]
    fn test_pem_armor() {
        let facade = facade();
        let mut se = facade.acquire().unwrap();
        se.generate_keypair(KeySlot::IDENTITY_KEY).unwrap();
        let identity = DeviceIdentity::from_uid(&[0x42; UID_LEN]).unwrap();
        let csr = CertificateRequest::build(&mut se, KeySlot::IDENTITY_KEY, &identity, None).unwrap();
        let pem = csr.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(pem::parse(&pem).unwrap().contents(), csr.to_der());
    }

    #[test]
    fn test_requires_key() {
        let facade = facade();
        let mut se = facade.acquire().unwrap();
        let identity = DeviceIdentity::from_uid(&[0x42; UID_LEN]).unwrap();
        assert!(matches!(
            CertificateRequest::build(&mut se, KeySlot::IDENTITY_KEY, &identity, None),
            Err(SeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_der_encode_length() {
        use der_encode::encode_length;
        let mut out = Vec::new();
        encode_length(&mut out, 42);
        encode_length(&mut out, 200);
        encode_length(&mut out, 300);
        assert_eq!(out, vec![42, 0x81, 200, 0x82, 0x01, 0x2C]);
    }
}
