//! Parsing of signed client certificates
//!
//! The CSR API returns `status.certificate` as bytes, but in practice the
//! payload arrives as PEM, as base64 text wrapping PEM, or as bare DER
//! depending on the signer and client library. [`parse_certificate`] tries
//! each encoding in turn and reports which one matched.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use x509_parser::prelude::*;

use crate::{PkiError, Result};

/// Encoding a certificate payload was found in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateEncoding {
    /// Base64 text whose decoded bytes are PEM
    Base64Pem,
    /// PEM text
    Pem,
    /// Raw DER bytes
    Der,
}

/// A successfully parsed X.509 certificate
#[derive(Clone, Debug)]
pub struct ParsedCertificate {
    /// Encoding the input was in
    pub encoding: CertificateEncoding,
    /// Validity start
    pub not_before: DateTime<Utc>,
    /// Validity end; the authoritative expiry for the credential
    pub not_after: DateTime<Utc>,
    /// Subject common name, empty if absent
    pub common_name: String,
    der: Vec<u8>,
}

impl ParsedCertificate {
    /// DER bytes of the certificate
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Canonical PEM form, independent of the input encoding
    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// Time left until `not_after`, negative once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> TimeDelta {
        self.not_after - now
    }

    /// True if the certificate expires within `window` of `now`
    pub fn expires_within(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        self.remaining_at(now) < window
    }
}

/// Parse a certificate in any supported encoding
///
/// Order: base64-wrapped PEM, raw PEM, raw DER. The first that yields a
/// valid X.509 certificate wins.
pub fn parse_certificate(data: &[u8]) -> Result<ParsedCertificate> {
    try_base64_pem(data)
        .or_else(|_| try_pem(data))
        .or_else(|_| try_der(data))
        .map_err(|e| {
            PkiError::ParseError(format!(
                "unable to parse certificate in any known format (last error: {})",
                e
            ))
        })
}

fn try_base64_pem(data: &[u8]) -> Result<ParsedCertificate> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = STANDARD
        .decode(compact)
        .map_err(|e| PkiError::ParseError(format!("base64 decode failed: {}", e)))?;
    let der = pem_certificate_der(&decoded)?;
    from_der(der, CertificateEncoding::Base64Pem)
}

fn try_pem(data: &[u8]) -> Result<ParsedCertificate> {
    let der = pem_certificate_der(data)?;
    from_der(der, CertificateEncoding::Pem)
}

fn try_der(data: &[u8]) -> Result<ParsedCertificate> {
    from_der(data.to_vec(), CertificateEncoding::Der)
}

/// First CERTIFICATE block of a PEM document
fn pem_certificate_der(data: &[u8]) -> Result<Vec<u8>> {
    let blocks = ::pem::parse_many(data)
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    blocks
        .into_iter()
        .find(|b| b.tag() == "CERTIFICATE")
        .map(|b| b.into_contents())
        .ok_or_else(|| PkiError::ParseError("no CERTIFICATE block in PEM".to_string()))
}

fn from_der(der: Vec<u8>, encoding: CertificateEncoding) -> Result<ParsedCertificate> {
    let (not_before, not_after, common_name) = {
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        (
            timestamp(cert.validity().not_before.timestamp())?,
            timestamp(cert.validity().not_after.timestamp())?,
            common_name,
        )
    };

    Ok(ParsedCertificate {
        encoding,
        not_before,
        not_after,
        common_name,
        der,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::ParseError(format!("validity timestamp {} out of range", secs)))
}
