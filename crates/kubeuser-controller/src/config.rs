//! Controller configuration
//!
//! Thresholds and intervals live in one value passed through [`Context`] so
//! tests can run the whole state machine with accelerated timings.
//!
//! [`Context`]: crate::controller::Context

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the API server address written into kubeconfigs
pub const API_SERVER_ENV: &str = "KUBERNETES_API_SERVER";

/// API server address used when [`API_SERVER_ENV`] is unset
pub const DEFAULT_API_SERVER: &str = "https://kubernetes.default.svc";

/// Namespace holding key and kubeconfig secrets plus identity ServiceAccounts
pub const DEFAULT_WORKING_NAMESPACE: &str = "kubeuser";

/// CA bundle mounted into every pod with a ServiceAccount token
pub const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Settings for the User controller
#[derive(Clone, Debug)]
pub struct UserControllerConfig {
    /// Namespace for credential secrets and identity ServiceAccounts
    pub working_namespace: String,
    /// Reissue the client certificate once less than this much validity remains
    pub rotation_threshold: Duration,
    /// API server URL embedded in generated kubeconfigs
    pub api_server: String,
    /// File tried first for the cluster CA
    pub in_cluster_ca_path: PathBuf,
    /// Namespace of the fallback CA ConfigMap
    pub root_ca_namespace: String,
    /// Name of the fallback CA ConfigMap
    pub root_ca_config_map: String,
    /// Key inside the fallback CA ConfigMap
    pub root_ca_key: String,
    /// Requeue while waiting on CSR approval or signing
    pub requeue_pending: Duration,
    /// Requeue after a credential failure
    pub requeue_credential_error: Duration,
    /// Expiry closer than this switches to `requeue_expiring`
    pub expiring_window: Duration,
    /// Requeue while inside `expiring_window`
    pub requeue_expiring: Duration,
    /// Periodic resync for healthy users
    pub requeue_resync: Duration,
    /// Backoff applied by the error policy
    pub error_backoff: ErrorBackoff,
}

impl Default for UserControllerConfig {
    fn default() -> Self {
        Self {
            working_namespace: DEFAULT_WORKING_NAMESPACE.to_string(),
            rotation_threshold: Duration::from_secs(30 * 24 * 60 * 60),
            api_server: DEFAULT_API_SERVER.to_string(),
            in_cluster_ca_path: PathBuf::from(IN_CLUSTER_CA_PATH),
            root_ca_namespace: "default".to_string(),
            root_ca_config_map: "kube-root-ca.crt".to_string(),
            root_ca_key: "ca.crt".to_string(),
            requeue_pending: Duration::from_secs(3),
            requeue_credential_error: Duration::from_secs(5),
            expiring_window: Duration::from_secs(24 * 60 * 60),
            requeue_expiring: Duration::from_secs(60 * 60),
            requeue_resync: Duration::from_secs(30 * 60),
            error_backoff: ErrorBackoff::default(),
        }
    }
}

impl UserControllerConfig {
    /// Defaults plus the API server override from the environment
    pub fn from_env() -> Self {
        Self::default().with_api_server(std::env::var(API_SERVER_ENV).ok())
    }

    /// Apply an optional API server override; empty values are ignored
    pub fn with_api_server(mut self, api_server: Option<String>) -> Self {
        if let Some(server) = api_server.filter(|s| !s.trim().is_empty()) {
            self.api_server = server;
        }
        self
    }
}

/// Exponential backoff for failed reconciles
#[derive(Clone, Debug)]
pub struct ErrorBackoff {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl ErrorBackoff {
    /// Delay after `failures` consecutive failures (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}
