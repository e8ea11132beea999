//! Shared status types

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Carry the transition time of `previous` forward if the status did not change
    ///
    /// Reason and message always come from `self`.
    pub fn preserving_transition(mut self, previous: Option<&Condition>) -> Self {
        if let Some(prev) = previous {
            if prev.type_ == self.type_ && prev.status == self.status {
                self.last_transition_time = prev.last_transition_time;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn old_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date")
    }

    #[test]
    fn new_condition_is_stamped_now() {
        let before = Utc::now();
        let condition = Condition::new("Ready", ConditionStatus::True, "UserProvisioned", "ok");
        let after = Utc::now();

        assert_eq!(condition.type_, "Ready");
        assert_eq!(condition.status, ConditionStatus::True);
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
    }

    #[test]
    fn unchanged_status_keeps_old_transition_time() {
        let mut prev = Condition::new("Ready", ConditionStatus::True, "UserProvisioned", "old");
        prev.last_transition_time = old_time();

        let next = Condition::new("Ready", ConditionStatus::True, "UserProvisioned", "new")
            .preserving_transition(Some(&prev));
        assert_eq!(next.last_transition_time, old_time());
        assert_eq!(next.message, "new");
    }

    #[test]
    fn changed_status_takes_new_transition_time() {
        let mut prev = Condition::new("Ready", ConditionStatus::False, "Provisioning", "");
        prev.last_transition_time = old_time();

        let next = Condition::new("Ready", ConditionStatus::True, "UserProvisioned", "")
            .preserving_transition(Some(&prev));
        assert!(next.last_transition_time > old_time());
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new("Ready", ConditionStatus::False, "Provisioning", "wait");
        let json = serde_json::to_value(&condition).expect("serialize");
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "False");
        assert!(json.get("lastTransitionTime").is_some());
        assert_eq!(ConditionStatus::from(true).to_string(), "True");
    }
}
