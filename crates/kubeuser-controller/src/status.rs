//! Status projection
//!
//! Pure functions from (current status, spec, expiry, now) to the next
//! status. Writing is done by the controller, which skips the write when the
//! projection equals what is already stored.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use kubeuser_common::crd::{
    Condition, ConditionStatus, ExpirySource, UserPhase, UserSpec, UserStatus, READY_CONDITION,
};

/// Reason attached to the Ready condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyReason {
    /// Resources are still being created
    Provisioning,
    /// A reconcile step failed
    ProvisioningFailed,
    /// Access has expired
    CertificateExpired,
    /// Bindings and credentials are in place
    UserProvisioned,
}

impl ReadyReason {
    /// CamelCase reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::ProvisioningFailed => "ProvisioningFailed",
            Self::CertificateExpired => "CertificateExpired",
            Self::UserProvisioned => "UserProvisioned",
        }
    }

    fn for_phase(phase: &UserPhase) -> Self {
        match phase {
            UserPhase::Pending => Self::Provisioning,
            UserPhase::Active => Self::UserProvisioned,
            UserPhase::Expired => Self::CertificateExpired,
            UserPhase::Error => Self::ProvisioningFailed,
        }
    }
}

/// Message used while resources are first created
pub const PENDING_MESSAGE: &str = "Initializing user resources";

/// Message used once the expiry instant has passed
pub const EXPIRED_MESSAGE: &str = "User access has expired";

/// Human-readable summary of granted bindings
pub fn binding_summary_message(roles: usize, cluster_roles: usize) -> String {
    match (roles, cluster_roles) {
        (0, 0) => "User has no assigned roles".to_string(),
        (r, 0) => format!("User provisioned with {} namespace role(s)", r),
        (0, c) => format!("User provisioned with {} cluster role(s)", c),
        (r, c) => format!(
            "User provisioned with {} namespace role(s) and {} cluster role(s)",
            r, c
        ),
    }
}

fn distinct_counts(spec: &UserSpec) -> (usize, usize) {
    let roles: BTreeSet<_> = spec
        .roles
        .iter()
        .map(|r| (r.namespace.as_str(), r.existing_role.as_str()))
        .collect();
    let cluster_roles: BTreeSet<_> = spec
        .cluster_roles
        .iter()
        .map(|c| c.existing_cluster_role.as_str())
        .collect();
    (roles.len(), cluster_roles.len())
}

fn with_ready(current: &UserStatus, phase: UserPhase, message: String) -> UserStatus {
    let ready = Condition::new(
        READY_CONDITION,
        ConditionStatus::from(phase == UserPhase::Active),
        ReadyReason::for_phase(&phase).as_str(),
        message.clone(),
    )
    .preserving_transition(current.get_condition(READY_CONDITION));

    current
        .clone()
        .phase(phase)
        .message(message)
        .condition(ready)
}

/// Project phase, message, expiry and the Ready condition
///
/// `expiry` is the effective expiry instant with its provenance; None clears
/// any stored expiry. An instant at or before `now` yields Expired.
pub fn project_status(
    current: &UserStatus,
    spec: &UserSpec,
    expiry: Option<(DateTime<Utc>, ExpirySource)>,
    now: DateTime<Utc>,
) -> UserStatus {
    let (phase, message) = match expiry {
        Some((at, _)) if at <= now => (UserPhase::Expired, EXPIRED_MESSAGE.to_string()),
        _ => {
            let (roles, cluster_roles) = distinct_counts(spec);
            (UserPhase::Active, binding_summary_message(roles, cluster_roles))
        }
    };

    let next = with_ready(current, phase, message);
    match expiry {
        Some((at, source)) => next.expiry(at, source),
        None => UserStatus {
            expiry_time: None,
            expiry_source: None,
            ..next
        },
    }
}

/// Initial Pending status for a User seen for the first time
pub fn pending_status(current: &UserStatus) -> UserStatus {
    with_ready(current, UserPhase::Pending, PENDING_MESSAGE.to_string())
}

/// Error status carrying `message`; expiry fields are left untouched
pub fn error_status(current: &UserStatus, message: impl Into<String>) -> UserStatus {
    with_ready(current, UserPhase::Error, message.into())
}
