//! Client-certificate kubeconfig
//!
//! The document has exactly one cluster, one context and one user. The
//! identity name appears in the context name, the context's user reference
//! and the user entry so `kubectl` picks it up with no flags.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{PkiError, Result};

/// Name of the single cluster entry
pub const CLUSTER_ENTRY_NAME: &str = "cluster";

/// Namespace selected by the generated context
pub const DEFAULT_CONTEXT_NAMESPACE: &str = "default";

/// Kubeconfig structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Contexts
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Context selected by default
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    /// Users
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// Context entry in kubeconfig
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// User entry in kubeconfig
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// Client key (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

impl Kubeconfig {
    /// Build a kubeconfig that authenticates `identity` with a client certificate
    ///
    /// `ca_pem`, `cert_pem` and `key_pem` are raw PEM; they are base64 encoded here.
    pub fn for_client_certificate(
        server: &str,
        ca_pem: &[u8],
        cert_pem: &str,
        key_pem: &str,
        identity: &str,
    ) -> Self {
        let context_name = format!("{}@{}", identity, CLUSTER_ENTRY_NAME);
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER_ENTRY_NAME.to_string(),
                cluster: ClusterConfig {
                    server: server.to_string(),
                    certificate_authority_data: Some(STANDARD.encode(ca_pem)),
                },
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: ContextConfig {
                    cluster: CLUSTER_ENTRY_NAME.to_string(),
                    user: identity.to_string(),
                    namespace: Some(DEFAULT_CONTEXT_NAMESPACE.to_string()),
                },
            }],
            current_context: context_name,
            users: vec![NamedUser {
                name: identity.to_string(),
                user: UserConfig {
                    client_certificate_data: Some(STANDARD.encode(cert_pem.as_bytes())),
                    client_key_data: Some(STANDARD.encode(key_pem.as_bytes())),
                },
            }],
        }
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| PkiError::Kubeconfig(format!("failed to serialize kubeconfig: {}", e)))
    }

    /// Parse from YAML (or JSON, which is valid YAML)
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(data)
            .map_err(|e| PkiError::Kubeconfig(format!("failed to parse kubeconfig: {}", e)))
    }

    /// User entry selected by the current context, or the first user
    pub fn active_user(&self) -> Option<&NamedUser> {
        let selected = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .and_then(|c| self.users.iter().find(|u| u.name == c.context.user));
        selected.or_else(|| self.users.first())
    }

    /// Decoded client certificate of the active user
    pub fn client_certificate(&self) -> Result<Vec<u8>> {
        let data = self
            .active_user()
            .and_then(|u| u.user.client_certificate_data.as_deref())
            .ok_or_else(|| {
                PkiError::Kubeconfig("client certificate data not found in kubeconfig".to_string())
            })?;
        STANDARD.decode(data.trim()).map_err(|e| {
            PkiError::Kubeconfig(format!("client-certificate-data is not base64: {}", e))
        })
    }
}

/// Extract the client certificate bytes from a stored kubeconfig document
pub fn client_certificate_from_kubeconfig(data: &[u8]) -> Result<Vec<u8>> {
    Kubeconfig::from_yaml(data)?.client_certificate()
}
