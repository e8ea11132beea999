//! Client credential material for kubeuser
//!
//! Everything here is pure: no Kubernetes API calls. The controller decides
//! when to generate a key or build a CSR; this crate only knows how.
//!
//! - [`keys`]: RSA key generation and CSR construction
//! - [`certificate`]: tolerant parsing of signer output (base64-PEM, PEM, DER)
//! - [`kubeconfig`]: assembling and reading back the client kubeconfig

#![deny(missing_docs)]

pub mod certificate;
pub mod keys;
pub mod kubeconfig;

pub use certificate::{parse_certificate, CertificateEncoding, ParsedCertificate};
pub use keys::{build_csr, generate_private_key};
pub use kubeconfig::{client_certificate_from_kubeconfig, Kubeconfig};

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Private key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Stored private key could not be loaded
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// CSR could not be built or serialized
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Kubeconfig could not be built or read
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
