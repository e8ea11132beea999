//! User CRD
//!
//! A User is a cluster-scoped declaration of a person's access: which
//! existing Roles and ClusterRoles they are bound to and how long the access
//! lasts. The controller turns it into bindings plus a client-certificate
//! kubeconfig stored in the working namespace.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::Condition;
use crate::Error;

/// Type of the single condition maintained on a User
pub const READY_CONDITION: &str = "Ready";

/// Desired access for a single identity.
///
/// Example:
/// ```yaml
/// apiVersion: auth.openkube.io/v1alpha1
/// kind: User
/// metadata:
///   name: alice
/// spec:
///   roles:
///     - namespace: dev
///       existingRole: developer
///   clusterRoles:
///     - existingClusterRole: view
///   expiry: 30d
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "auth.openkube.io",
    version = "v1alpha1",
    kind = "User",
    status = "UserStatus",
    shortname = "ku",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Expiry","type":"string","jsonPath":".status.expiryTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Namespace-scoped bindings to existing Roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleSpec>,

    /// Cluster-wide bindings to existing ClusterRoles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_roles: Vec<ClusterRoleSpec>,

    /// How long access should last (e.g., "30m", "24h", "7d")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

/// Binding to an existing Role inside one namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// Namespace where the RoleBinding is created
    #[schemars(length(min = 1))]
    pub namespace: String,

    /// Name of the Role inside that namespace
    #[schemars(length(min = 1))]
    pub existing_role: String,
}

/// Binding to an existing ClusterRole
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleSpec {
    /// Name of the ClusterRole to bind
    #[schemars(length(min = 1))]
    pub existing_cluster_role: String,
}

/// Observed state of a User
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Coarse lifecycle phase; unset until the first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<UserPhase>,

    /// Most recent human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When access ends (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<String>,

    /// Where `expiry_time` came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_source: Option<ExpirySource>,

    /// Timestamped conditions (currently only Ready)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// User lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UserPhase {
    /// Resources are being provisioned
    #[default]
    Pending,
    /// Bindings exist and access is valid
    Active,
    /// Access has passed its expiry time
    Expired,
    /// Reconciliation failed and needs operator attention
    Error,
}

impl std::fmt::Display for UserPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Expired => write!(f, "Expired"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Origin of `status.expiryTime`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExpirySource {
    /// creationTimestamp + spec.expiry, used until a certificate is issued
    Calculated,
    /// notAfter of the issued client certificate
    Certificate,
}

impl UserStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: UserPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: UserPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the expiry and its source and return self for chaining
    pub fn expiry(mut self, at: DateTime<Utc>, source: ExpirySource) -> Self {
        self.expiry_time = Some(at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        self.expiry_source = Some(source);
        self
    }

    /// Add a condition, replacing any existing condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Parse `expiry_time`; None when unset or malformed
    pub fn parsed_expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

impl User {
    /// Current phase, if one has been recorded
    pub fn phase(&self) -> Option<UserPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Name of the secret holding the private key
    pub fn key_secret_name(&self) -> String {
        format!("{}-key", self.name_any())
    }

    /// Name of the secret holding the assembled kubeconfig
    pub fn kubeconfig_secret_name(&self) -> String {
        format!("{}-kubeconfig", self.name_any())
    }

    /// Name of the CertificateSigningRequest
    pub fn csr_name(&self) -> String {
        format!("{}-csr", self.name_any())
    }

    /// Name of the RoleBinding for `role`
    pub fn role_binding_name(&self, role: &str) -> String {
        format!("{}-{}-rb", self.name_any(), role)
    }

    /// Name of the ClusterRoleBinding for `cluster_role`
    pub fn cluster_role_binding_name(&self, cluster_role: &str) -> String {
        format!("{}-{}-crb", self.name_any(), cluster_role)
    }

    /// Expiry derived from creationTimestamp + `spec.expiry`
    ///
    /// Returns `Ok(None)` when no expiry is requested or the object has not
    /// been persisted yet. A malformed duration is a validation error.
    pub fn calculated_expiry(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let Some(raw) = self.spec.expiry.as_deref() else {
            return Ok(None);
        };
        let duration = parse_expiry(raw).map_err(|e| {
            Error::validation_for_field(self.name_any(), "spec.expiry", e.to_string())
        })?;
        let Some(created) = self.metadata.creation_timestamp.as_ref() else {
            return Ok(None);
        };
        let delta = TimeDelta::from_std(duration).map_err(|_| {
            Error::validation_for_field(self.name_any(), "spec.expiry", "expiry is too large")
        })?;
        created
            .0
            .checked_add_signed(delta)
            .map(Some)
            .ok_or_else(|| {
                Error::validation_for_field(self.name_any(), "spec.expiry", "expiry is too large")
            })
    }
}

/// Reasons an expiry duration string is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpiryParseError {
    /// Empty or whitespace-only input
    #[error("expiry must not be empty")]
    Empty,
    /// A unit with no number in front of it, or stray characters
    #[error("invalid expiry '{0}': expected <number><unit>, e.g. 24h or 7d")]
    Malformed(String),
    /// Unit other than s, m, h, d, w
    #[error("unknown expiry unit '{0}' (use s, m, h, d or w)")]
    UnknownUnit(String),
    /// Total duration is zero
    #[error("expiry must be greater than zero")]
    Zero,
    /// Total duration does not fit
    #[error("expiry is too large")]
    Overflow,
}

/// Parse a duration such as `30m`, `24h`, `7d`, `2w` or `1d12h`
pub fn parse_expiry(input: &str) -> Result<Duration, ExpiryParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ExpiryParseError::Empty);
    }

    let mut total: u64 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(ExpiryParseError::Malformed(input.to_string()));
        }
        let (number, tail) = rest.split_at(digits);
        let unit_len = tail.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        if unit_len == 0 {
            return Err(ExpiryParseError::Malformed(input.to_string()));
        }
        let (unit, tail) = tail.split_at(unit_len);

        let value: u64 = number.parse().map_err(|_| ExpiryParseError::Overflow)?;
        let seconds_per_unit: u64 = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            other => return Err(ExpiryParseError::UnknownUnit(other.to_string())),
        };
        total = value
            .checked_mul(seconds_per_unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or(ExpiryParseError::Overflow)?;
        rest = tail;
    }

    if total == 0 {
        return Err(ExpiryParseError::Zero);
    }
    Ok(Duration::from_secs(total))
}
