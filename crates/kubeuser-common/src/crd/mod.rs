//! Custom Resource Definitions for kubeuser

mod types;
mod user;

pub use types::{Condition, ConditionStatus};
pub use user::{
    parse_expiry, ClusterRoleSpec, ExpiryParseError, ExpirySource, RoleSpec, User, UserPhase,
    UserSpec, UserStatus, READY_CONDITION,
};
