//! Private key and CSR generation

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, RsaKeySize};

use crate::{PkiError, Result};

/// Generate a fresh RSA-2048 private key, PKCS#8 PEM encoded
pub fn generate_private_key() -> Result<String> {
    let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e)))?;
    Ok(key_pair.serialize_pem())
}

/// Build a PEM CSR for `identity`, signed with the key in `key_pem`
///
/// The subject carries only the common name; no SANs are requested since
/// the API server maps CN straight to the user name.
pub fn build_csr(identity: &str, key_pem: &str) -> Result<String> {
    let key_pair = KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::InvalidKey(format!("failed to load private key: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(identity.to_string()));
    params.distinguished_name = dn;
    params.subject_alt_names = Vec::new();

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to create CSR: {}", e)))?;

    csr.pem()
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to serialize CSR: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn generated_key_is_pkcs8_rsa() {
        let key_pem = generate_private_key().expect("key generation should succeed");
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let key = KeyPair::from_pem(&key_pem).expect("key should reload");
        assert!(key.is_compatible(&rcgen::PKCS_RSA_SHA256));
    }

    #[test]
    fn csr_subject_is_identity_without_sans() {
        let key_pem = generate_private_key().expect("key generation should succeed");
        let csr_pem = build_csr("alice", &key_pem).expect("CSR generation should succeed");
        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));

        let der = ::pem::parse(csr_pem.as_bytes()).expect("pem");
        let (_, csr) = X509CertificationRequest::from_der(der.contents()).expect("parse csr");
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("alice"));
        assert!(csr.requested_extensions().map_or(true, |mut exts| exts
            .all(|e| !matches!(e, ParsedExtension::SubjectAlternativeName(_)))));
    }

    #[test]
    fn same_key_gives_same_public_key_in_every_csr() {
        let key_pem = generate_private_key().expect("key generation should succeed");
        let spki = |csr_pem: String| {
            let der = ::pem::parse(csr_pem.as_bytes()).expect("pem");
            let (_, csr) = X509CertificationRequest::from_der(der.contents()).expect("parse");
            csr.certification_request_info.subject_pki.raw.to_vec()
        };
        let first = spki(build_csr("alice", &key_pem).expect("csr"));
        let second = spki(build_csr("alice", &key_pem).expect("csr"));
        assert_eq!(first, second);
    }

    #[test]
    fn garbage_key_is_rejected() {
        let err = build_csr("alice", "not a key").expect_err("should fail");
        assert!(matches!(err, PkiError::InvalidKey(_)));
    }
}
