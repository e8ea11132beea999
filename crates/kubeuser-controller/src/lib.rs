//! User reconciliation for kubeuser
//!
//! A User resource becomes RoleBindings, ClusterRoleBindings and a
//! client-certificate kubeconfig. Each reconcile pass re-reads the cluster
//! and advances one step at a time; waiting on the external signer ends the
//! pass with a requeue instead of blocking.

#![deny(missing_docs)]

pub mod bindings;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::{ErrorBackoff, UserControllerConfig};
pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
