//! RoleBinding and ClusterRoleBinding convergence
//!
//! Desired bindings come from the User spec; existing bindings are found by
//! the ownership label, never by predicted name. Both sides are keyed by
//! (namespace, roleRef.name) and diffed:
//!
//! - desired, no existing: create
//! - existing matches: leave alone
//! - subject drift: replace in place, carrying the read resourceVersion
//! - roleRef drift: delete and recreate (roleRef is immutable)
//! - existing, not desired (or a duplicate): delete
//!
//! Every referenced Role and ClusterRole is checked before the first write,
//! so a bad reference never leaves a half-applied set behind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use kubeuser_common::crd::User;
use kubeuser_common::{
    user_label_selector, Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBEUSER, USER_LABEL_KEY,
};

use crate::controller::KubeClient;

/// API group of RBAC objects and of the User subject kind
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Key identifying one binding: namespace (None for cluster scope) and role name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingKey {
    /// Namespace of a RoleBinding; None for ClusterRoleBindings
    pub namespace: Option<String>,
    /// Referenced Role or ClusterRole name
    pub role: String,
}

/// A binding kind this controller manages
#[async_trait]
pub trait ManagedBinding: Clone + Send + Sync + Sized + 'static {
    /// Kind name for logs
    const KIND: &'static str;

    /// Object metadata
    fn object_meta(&self) -> &ObjectMeta;
    /// Mutable object metadata
    fn object_meta_mut(&mut self) -> &mut ObjectMeta;
    /// Referenced role
    fn role_ref(&self) -> &RoleRef;
    /// Bound subjects
    fn subjects(&self) -> &[Subject];

    /// List bindings carrying `label_selector`
    async fn list(kube: &dyn KubeClient, label_selector: &str) -> Result<Vec<Self>, Error>;
    /// Create the binding
    async fn create(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error>;
    /// Replace the binding; metadata carries the expected resourceVersion
    async fn replace(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error>;
    /// Delete the binding; absent is success
    async fn delete(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error>;

    /// Key under which this binding is compared
    fn key(&self) -> BindingKey {
        BindingKey {
            namespace: self.object_meta().namespace.clone(),
            role: self.role_ref().name.clone(),
        }
    }
}

#[async_trait]
impl ManagedBinding for RoleBinding {
    const KIND: &'static str = "RoleBinding";

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    async fn list(kube: &dyn KubeClient, label_selector: &str) -> Result<Vec<Self>, Error> {
        kube.list_role_bindings(label_selector).await
    }

    async fn create(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        kube.create_role_binding(binding).await
    }

    async fn replace(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        kube.replace_role_binding(binding).await
    }

    async fn delete(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        let namespace = binding.namespace().ok_or_else(|| {
            Error::internal_with_context("bindings", "RoleBinding without namespace")
        })?;
        kube.delete_role_binding(&binding.name_any(), &namespace).await
    }
}

#[async_trait]
impl ManagedBinding for ClusterRoleBinding {
    const KIND: &'static str = "ClusterRoleBinding";

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    async fn list(kube: &dyn KubeClient, label_selector: &str) -> Result<Vec<Self>, Error> {
        kube.list_cluster_role_bindings(label_selector).await
    }

    async fn create(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        kube.create_cluster_role_binding(binding).await
    }

    async fn replace(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        kube.replace_cluster_role_binding(binding).await
    }

    async fn delete(kube: &dyn KubeClient, binding: &Self) -> Result<(), Error> {
        kube.delete_cluster_role_binding(&binding.name_any()).await
    }
}

/// One step needed to converge existing bindings onto desired ones
#[derive(Clone, Debug, PartialEq)]
pub enum BindingChange<B> {
    /// Nothing exists for this key
    Create(B),
    /// Subjects drifted; update in place
    Replace(B),
    /// roleRef drifted; remove `stale` then create `desired`
    Recreate {
        /// Binding to remove
        stale: B,
        /// Binding to create
        desired: B,
    },
    /// No longer desired, or a duplicate for a key
    Delete(B),
}

/// Counts of changes applied in one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindingSummary {
    /// Bindings created (including recreations)
    pub created: usize,
    /// Bindings replaced in place
    pub updated: usize,
    /// Bindings deleted (excluding recreations)
    pub deleted: usize,
    /// Bindings already correct
    pub unchanged: usize,
}

impl BindingSummary {
    /// True if nothing was written
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Result of reconciling both binding kinds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindingsOutcome {
    /// RoleBinding changes
    pub role_bindings: BindingSummary,
    /// ClusterRoleBinding changes
    pub cluster_role_bindings: BindingSummary,
}

fn user_subject(user: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "User".to_string(),
        name: user.to_string(),
        namespace: None,
    }
}

fn binding_metadata(user: &User, name: String, namespace: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace,
        labels: Some(BTreeMap::from([
            (USER_LABEL_KEY.to_string(), user.name_any()),
            (
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_KUBEUSER.to_string(),
            ),
        ])),
        owner_references: user.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// RoleBindings requested by `spec.roles`, keyed by (namespace, role)
pub fn desired_role_bindings(user: &User) -> BTreeMap<BindingKey, RoleBinding> {
    let name = user.name_any();
    user.spec
        .roles
        .iter()
        .map(|role| {
            let key = BindingKey {
                namespace: Some(role.namespace.clone()),
                role: role.existing_role.clone(),
            };
            let binding = RoleBinding {
                metadata: binding_metadata(
                    user,
                    user.role_binding_name(&role.existing_role),
                    Some(role.namespace.clone()),
                ),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: role.existing_role.clone(),
                },
                subjects: Some(vec![user_subject(&name)]),
            };
            (key, binding)
        })
        .collect()
}

/// ClusterRoleBindings requested by `spec.clusterRoles`, keyed by cluster role
pub fn desired_cluster_role_bindings(user: &User) -> BTreeMap<BindingKey, ClusterRoleBinding> {
    let name = user.name_any();
    user.spec
        .cluster_roles
        .iter()
        .map(|cr| {
            let key = BindingKey {
                namespace: None,
                role: cr.existing_cluster_role.clone(),
            };
            let binding = ClusterRoleBinding {
                metadata: binding_metadata(
                    user,
                    user.cluster_role_binding_name(&cr.existing_cluster_role),
                    None,
                ),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name: cr.existing_cluster_role.clone(),
                },
                subjects: Some(vec![user_subject(&name)]),
            };
            (key, binding)
        })
        .collect()
}

/// True if `existing` grants what `desired` grants to the same single subject
///
/// Labels and owner references are deliberately not compared.
pub fn binding_matches<B: ManagedBinding>(existing: &B, desired: &B) -> bool {
    if existing.role_ref() != desired.role_ref() {
        return false;
    }
    match (existing.subjects(), desired.subjects()) {
        ([have], [want]) => have.kind == want.kind && have.name == want.name,
        _ => false,
    }
}

/// Diff desired against existing bindings
///
/// Pure; the returned changes are applied in order by [`apply_changes`].
pub fn plan_bindings<B: ManagedBinding>(
    desired: &BTreeMap<BindingKey, B>,
    existing: Vec<B>,
) -> (Vec<BindingChange<B>>, usize) {
    let mut by_key: BTreeMap<BindingKey, Vec<B>> = BTreeMap::new();
    for binding in existing {
        by_key.entry(binding.key()).or_default().push(binding);
    }

    let mut changes = Vec::new();
    let mut unchanged = 0;

    for (key, want) in desired {
        let Some(mut group) = by_key.remove(key) else {
            changes.push(BindingChange::Create(want.clone()));
            continue;
        };

        // Prefer the binding already carrying the deterministic name
        group.sort_by(|a, b| a.object_meta().name.cmp(&b.object_meta().name));
        let primary_idx = group
            .iter()
            .position(|b| b.object_meta().name == want.object_meta().name)
            .unwrap_or(0);
        let primary = group.remove(primary_idx);
        changes.extend(group.into_iter().map(BindingChange::Delete));

        if binding_matches(&primary, want) {
            unchanged += 1;
        } else if primary.role_ref() != want.role_ref() {
            changes.push(BindingChange::Recreate {
                stale: primary,
                desired: want.clone(),
            });
        } else {
            let mut updated = want.clone();
            updated.object_meta_mut().name = primary.object_meta().name.clone();
            updated.object_meta_mut().resource_version = primary.object_meta().resource_version.clone();
            changes.push(BindingChange::Replace(updated));
        }
    }

    for (_, leftover) in by_key {
        changes.extend(leftover.into_iter().map(BindingChange::Delete));
    }

    (changes, unchanged)
}

/// Create a binding whose name another object already holds
///
/// Labelled bindings of this user were all listed before planning, so a 409
/// here means the name belongs to something else: another user's binding
/// whose derived name collides, or a hand-made object. That is surfaced as a
/// validation error naming the binding so it reaches status.
async fn create_binding<B: ManagedBinding>(kube: &dyn KubeClient, binding: &B) -> Result<(), Error> {
    match B::create(kube, binding).await {
        Err(e) if e.is_conflict() => {
            let meta = binding.object_meta();
            let name = meta.name.clone().unwrap_or_default();
            let user = meta
                .labels
                .as_ref()
                .and_then(|l| l.get(USER_LABEL_KEY))
                .cloned()
                .unwrap_or_default();
            let location = meta
                .namespace
                .as_ref()
                .map(|ns| format!(" in namespace {}", ns))
                .unwrap_or_default();
            warn!(kind = B::KIND, name = %name, namespace = ?meta.namespace, "binding name is held by another object");
            Err(Error::validation_for(
                user,
                format!(
                    "{} {}{} already exists and is not managed for this user",
                    B::KIND,
                    name,
                    location
                ),
            ))
        }
        other => other,
    }
}

/// Apply planned changes in order, stopping at the first error
pub async fn apply_changes<B: ManagedBinding>(
    kube: &dyn KubeClient,
    changes: Vec<BindingChange<B>>,
    unchanged: usize,
) -> Result<BindingSummary, Error> {
    let mut summary = BindingSummary {
        unchanged,
        ..Default::default()
    };

    for change in changes {
        match change {
            BindingChange::Create(binding) => {
                info!(kind = B::KIND, name = ?binding.object_meta().name, namespace = ?binding.object_meta().namespace, "creating binding");
                create_binding(kube, &binding).await?;
                summary.created += 1;
            }
            BindingChange::Replace(binding) => {
                info!(kind = B::KIND, name = ?binding.object_meta().name, namespace = ?binding.object_meta().namespace, "updating binding subjects");
                B::replace(kube, &binding).await?;
                summary.updated += 1;
            }
            BindingChange::Recreate { stale, desired } => {
                info!(kind = B::KIND, name = ?stale.object_meta().name, namespace = ?stale.object_meta().namespace, "roleRef changed, recreating binding");
                B::delete(kube, &stale).await?;
                create_binding(kube, &desired).await?;
                summary.created += 1;
            }
            BindingChange::Delete(binding) => {
                info!(kind = B::KIND, name = ?binding.object_meta().name, namespace = ?binding.object_meta().namespace, "deleting binding");
                B::delete(kube, &binding).await?;
                summary.deleted += 1;
            }
        }
    }

    Ok(summary)
}

/// Check every referenced Role and ClusterRole exists
///
/// Fails on the first missing reference with a message naming it.
pub async fn validate_role_references(user: &User, kube: &dyn KubeClient) -> Result<(), Error> {
    let name = user.name_any();
    for (i, role) in user.spec.roles.iter().enumerate() {
        if !kube.role_exists(&role.existing_role, &role.namespace).await? {
            return Err(Error::validation_for_field(
                &name,
                format!("spec.roles[{}].existingRole", i),
                format!(
                    "role {} not found in namespace {}",
                    role.existing_role, role.namespace
                ),
            ));
        }
    }
    for (i, cr) in user.spec.cluster_roles.iter().enumerate() {
        if !kube.cluster_role_exists(&cr.existing_cluster_role).await? {
            return Err(Error::validation_for_field(
                &name,
                format!("spec.clusterRoles[{}].existingClusterRole", i),
                format!("clusterrole {} not found", cr.existing_cluster_role),
            ));
        }
    }
    Ok(())
}

async fn converge<B: ManagedBinding>(
    kube: &dyn KubeClient,
    selector: &str,
    desired: BTreeMap<BindingKey, B>,
) -> Result<BindingSummary, Error> {
    let existing = B::list(kube, selector).await?;
    let (changes, unchanged) = plan_bindings(&desired, existing);
    let summary = apply_changes(kube, changes, unchanged).await?;
    debug!(kind = B::KIND, ?summary, "bindings converged");
    Ok(summary)
}

/// Converge RoleBindings then ClusterRoleBindings for `user`
#[instrument(skip(user, kube), fields(user = %user.name_any()))]
pub async fn reconcile_bindings(
    user: &User,
    kube: &dyn KubeClient,
) -> Result<BindingsOutcome, Error> {
    validate_role_references(user, kube).await?;

    let selector = user_label_selector(&user.name_any());
    let role_bindings = converge(kube, &selector, desired_role_bindings(user)).await?;
    let cluster_role_bindings =
        converge(kube, &selector, desired_cluster_role_bindings(user)).await?;

    Ok(BindingsOutcome {
        role_bindings,
        cluster_role_bindings,
    })
}
