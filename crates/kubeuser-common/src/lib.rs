//! Common types for kubeuser: the User CRD, errors, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the User CRD
pub const API_GROUP: &str = "auth.openkube.io";

/// Label carried by every resource created on behalf of a User.
///
/// The value is the User name. Discovery always goes through this label,
/// never through predicted resource names.
pub const USER_LABEL_KEY: &str = "auth.openkube.io/user";

/// Finalizer guarding deletion until derived resources are removed
pub const USER_FINALIZER: &str = "auth.openkube.io/finalizer";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label on resources this operator creates
pub const LABEL_MANAGED_BY_KUBEUSER: &str = "kubeuser";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "kubeuser-controller";

/// Build a label selector matching resources owned by `user`
pub fn user_label_selector(user: &str) -> String {
    format!("{}={}", USER_LABEL_KEY, user)
}
