//! User controller implementation
//!
//! Each pass re-reads the User and walks it forward: finalizer, expiry gate,
//! identity anchor, bindings, status, credentials. Steps that depend on the
//! external signer end the pass with a short requeue instead of waiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kubeuser_common::crd::{ExpirySource, User, UserPhase, UserStatus};
use kubeuser_common::{
    Error, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBEUSER, USER_FINALIZER,
    USER_LABEL_KEY,
};

use crate::bindings::reconcile_bindings;
use crate::cleanup::cleanup_user;
use crate::config::UserControllerConfig;
use crate::credentials::{ensure_credentials, CredentialOutcome};
use crate::status::{error_status, pending_status, project_status};

/// Trait abstracting Kubernetes client operations for User reconciliation
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Every delete treats "already gone" as
/// success, and every `get_*` maps 404 to `None`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a User by name
    async fn get_user(&self, name: &str) -> Result<Option<User>, Error>;

    /// Patch the status of a User
    ///
    /// Unset optional fields are written as explicit nulls so stale values
    /// are cleared by the merge. Returns the User's new resourceVersion.
    async fn patch_user_status(
        &self,
        name: &str,
        status: &UserStatus,
    ) -> Result<Option<String>, Error>;

    /// Add `finalizer` to the User's finalizer list
    ///
    /// The write carries `user`'s resourceVersion and fails with 409 when
    /// the User changed since it was read.
    async fn add_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error>;

    /// Remove `finalizer` from the User; an absent User is success
    ///
    /// Guarded by `user`'s resourceVersion like [`KubeClient::add_user_finalizer`].
    async fn remove_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error>;

    /// Ensure a namespace exists, creating it if it doesn't
    async fn ensure_namespace(&self, name: &str) -> Result<(), Error>;

    /// Get a ServiceAccount by name and namespace
    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount in the namespace named by its metadata
    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error>;

    /// Delete a ServiceAccount
    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Check whether a Role exists
    async fn role_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// Check whether a ClusterRole exists
    async fn cluster_role_exists(&self, name: &str) -> Result<bool, Error>;

    /// List RoleBindings across all namespaces matching a label selector
    async fn list_role_bindings(&self, label_selector: &str) -> Result<Vec<RoleBinding>, Error>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), Error>;

    /// Replace a RoleBinding; fails with 409 if its resourceVersion is stale
    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), Error>;

    /// Delete a RoleBinding
    async fn delete_role_binding(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// List ClusterRoleBindings matching a label selector
    async fn list_cluster_role_bindings(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error>;

    /// Create a ClusterRoleBinding
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding)
        -> Result<(), Error>;

    /// Replace a ClusterRoleBinding; fails with 409 if its resourceVersion is stale
    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error>;

    /// Delete a ClusterRoleBinding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret in the namespace named by its metadata
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a Secret
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a CertificateSigningRequest by name
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error>;

    /// Create a CertificateSigningRequest
    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error>;

    /// Write the approval subresource from the conditions carried by `csr`
    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error>;

    /// Delete a CertificateSigningRequest
    async fn delete_csr(&self, name: &str) -> Result<(), Error>;

    /// Get a ConfigMap by name and namespace
    async fn get_config_map(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn namespace_of<K: Resource>(obj: &K, kind: &str) -> Result<String, Error> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::internal_with_context("kube-client", format!("{} has no namespace", kind)))
}

/// Merge patch replacing the finalizer list, guarded by the read resourceVersion
///
/// The API server rejects the patch with 409 when `resource_version` is
/// stale, so a list computed from an old snapshot never overwrites another
/// writer's finalizers.
fn finalizer_patch(finalizers: Vec<String>, resource_version: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": resource_version,
        }
    })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_user(&self, name: &str) -> Result<Option<User>, Error> {
        let api: Api<User> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn patch_user_status(
        &self,
        name: &str,
        status: &UserStatus,
    ) -> Result<Option<String>, Error> {
        let api: Api<User> = Api::all(self.client.clone());

        let status_patch = serde_json::json!({
            "status": {
                "phase": status.phase,
                "message": status.message,
                "expiryTime": status.expiry_time,
                "expirySource": status.expiry_source,
                "conditions": status.conditions,
            }
        });

        let patched = api
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(patched.resource_version())
    }

    async fn add_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error> {
        let api: Api<User> = Api::all(self.client.clone());
        let mut finalizers = user.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        api.patch(
            &user.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&finalizer_patch(
                finalizers,
                user.meta().resource_version.as_deref(),
            )),
        )
        .await?;
        Ok(())
    }

    async fn remove_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error> {
        let api: Api<User> = Api::all(self.client.clone());
        let finalizers: Vec<String> = user
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();

        let result = api
            .patch(
                &user.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&finalizer_patch(
                    finalizers,
                    user.meta().resource_version.as_deref(),
                )),
            )
            .await;
        ignore_not_found(result)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        if found(api.get(name).await)?.is_some() {
            debug!(namespace = %name, "namespace already exists");
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_KUBEUSER.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        info!(namespace = %name, "creating working namespace");
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        let namespace = namespace_of(sa, "ServiceAccount")?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), sa).await?;
        Ok(())
    }

    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn role_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(found(api.get(name).await)?.is_some())
    }

    async fn cluster_role_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(found(api.get(name).await)?.is_some())
    }

    async fn list_role_bindings(&self, label_selector: &str) -> Result<Vec<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let namespace = namespace_of(binding, "RoleBinding")?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let namespace = namespace_of(binding, "RoleBinding")?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_cluster_role_bindings(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = namespace_of(secret, "Secret")?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        api.create(&PostParams::default(), csr).await?;
        Ok(())
    }

    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let body = serde_json::to_vec(csr).map_err(|e| {
            Error::serialization_for_kind("CertificateSigningRequest", e.to_string())
        })?;
        api.replace_subresource("approval", &csr.name_any(), &PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn delete_csr(&self, name: &str) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
    }
}

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Operator configuration
    pub config: UserControllerConfig,
    /// Consecutive failures per User, driving error backoff
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a new controller context with default configuration
    pub fn new(client: Client) -> Self {
        Self::with_config(client, UserControllerConfig::default())
    }

    /// Create a new controller context with the given configuration
    pub fn with_config(client: Client, config: UserControllerConfig) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
            config,
            failures: DashMap::new(),
        }
    }

    /// Create a context for testing with a mock or fake client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, config: UserControllerConfig) -> Self {
        Self {
            kube,
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `user` and return how long to wait before retrying
    pub fn next_backoff(&self, user: &str) -> Duration {
        let mut failures = self.failures.entry(user.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        self.config.error_backoff.delay_for(*failures)
    }

    /// Forget recorded failures for `user`
    pub fn reset_backoff(&self, user: &str) {
        self.failures.remove(user);
    }
}

/// Reconcile a User resource
///
/// The watched object is only a trigger; the User is re-read so every
/// decision is made against current state.
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn reconcile(user: Arc<User>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = user.name_any();

    let Some(user) = ctx.kube.get_user(&name).await? else {
        debug!("user no longer exists");
        ctx.reset_backoff(&name);
        return Ok(Action::await_change());
    };

    let action = reconcile_user(&user, &ctx).await?;
    ctx.reset_backoff(&name);
    Ok(action)
}

/// Error policy for the controller
///
/// Requeues with exponential backoff per User; a successful pass resets it.
pub fn error_policy(user: Arc<User>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = user.name_any();
    let delay = ctx.next_backoff(&name);
    error!(
        ?error,
        user = %name,
        retryable = error.is_retryable(),
        delay_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_user(user: &User, ctx: &Context) -> Result<Action, Error> {
    // Carries the newest resourceVersion seen this pass for guarded writes
    let mut user = user.clone();
    let mut observed = user.status.clone().unwrap_or_default();

    if observed.phase.is_none() {
        let pending = pending_status(&observed);
        if let Err(e) = write_status(ctx, &mut user, &mut observed, pending).await {
            warn!(error = %e, "failed to record initial Pending status");
        }
    }

    if user.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&user) {
            cleanup_user(&user, ctx).await?;
        } else {
            debug!("user is being deleted and carries no finalizer");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&user) {
        info!("adding finalizer");
        ctx.kube.add_user_finalizer(&user, USER_FINALIZER).await?;
    }

    let expiry = effective_expiry(&user);

    let now = Utc::now();
    if let Some((at, _)) = expiry {
        if at <= now {
            info!(expiry = %at, "user access has expired");
            let expired = project_status(&observed, &user.spec, expiry, now);
            write_status(ctx, &mut user, &mut observed, expired).await?;
            return Ok(Action::await_change());
        }
    }

    ctx.kube
        .ensure_namespace(&ctx.config.working_namespace)
        .await?;
    ensure_service_account(&user, ctx).await?;

    match reconcile_bindings(&user, ctx.kube.as_ref()).await {
        Ok(outcome) => debug!(?outcome, "bindings reconciled"),
        Err(e) => {
            return Err(record_failure(
                ctx,
                &mut user,
                &mut observed,
                "Failed to reconcile bindings: ",
                e,
            )
            .await)
        }
    }

    let projected = project_status(&observed, &user.spec, expiry, now);
    write_status(ctx, &mut user, &mut observed, projected).await?;

    let expiry = match ensure_credentials(&user, ctx).await {
        Ok(CredentialOutcome::Ready(issued)) => {
            if issued.newly_issued {
                info!(not_after = %issued.not_after, "client certificate issued");
            }
            let expiry = Some((issued.not_after, ExpirySource::Certificate));
            let projected = project_status(&observed, &user.spec, expiry, Utc::now());
            write_status(ctx, &mut user, &mut observed, projected).await?;
            expiry
        }
        Ok(CredentialOutcome::Pending(state)) => {
            debug!(?state, "credential workflow in progress");
            return Ok(Action::requeue(ctx.config.requeue_pending));
        }
        Err(e) => {
            warn!(error = %e, "credential provisioning failed, retrying");
            if matches!(e, Error::Credential { .. }) {
                let failed = error_status(
                    &observed,
                    format!("Failed to provision credentials: {}", e.detail()),
                );
                if let Err(write_err) = write_status(ctx, &mut user, &mut observed, failed).await
                {
                    warn!(error = %write_err, "failed to record credential error");
                }
            }
            return Ok(Action::requeue(ctx.config.requeue_credential_error));
        }
    };

    Ok(requeue_for_expiry(observed.phase, expiry, Utc::now(), &ctx.config))
}

fn has_finalizer(user: &User) -> bool {
    user.finalizers().iter().any(|f| f == USER_FINALIZER)
}

/// Expiry that governs the Expired gate
///
/// A certificate-sourced expiry already recorded in status wins; otherwise
/// the value is calculated from creationTimestamp + `spec.expiry`. An
/// unparseable `spec.expiry` is logged and treated as absent.
fn effective_expiry(user: &User) -> Option<(DateTime<Utc>, ExpirySource)> {
    if let Some(status) = &user.status {
        if status.expiry_source == Some(ExpirySource::Certificate) {
            if let Some(at) = status.parsed_expiry() {
                return Some((at, ExpirySource::Certificate));
            }
        }
    }
    match user.calculated_expiry() {
        Ok(at) => at.map(|at| (at, ExpirySource::Calculated)),
        Err(e) => {
            warn!(
                expiry = ?user.spec.expiry,
                error = %e,
                "ignoring unparseable expiry"
            );
            None
        }
    }
}

fn requeue_for_expiry(
    phase: Option<UserPhase>,
    expiry: Option<(DateTime<Utc>, ExpirySource)>,
    now: DateTime<Utc>,
    config: &UserControllerConfig,
) -> Action {
    if phase == Some(UserPhase::Expired) {
        return Action::await_change();
    }
    let Some((at, _)) = expiry else {
        return Action::requeue(config.requeue_resync);
    };
    match (at - now).to_std() {
        Ok(remaining) if remaining < config.expiring_window => {
            debug!(expiry = %at, "access expires soon");
            Action::requeue(config.requeue_expiring)
        }
        Ok(_) => Action::requeue(config.requeue_resync),
        Err(_) => Action::await_change(),
    }
}

/// Write `next` unless it equals what is already stored
///
/// `observed` tracks the stored status and only moves on a successful write;
/// `user` picks up the resourceVersion the write produced.
async fn write_status(
    ctx: &Context,
    user: &mut User,
    observed: &mut UserStatus,
    next: UserStatus,
) -> Result<(), Error> {
    if *observed == next {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let resource_version = ctx.kube.patch_user_status(&user.name_any(), &next).await?;
    if resource_version.is_some() {
        user.metadata.resource_version = resource_version;
    }
    *observed = next;
    Ok(())
}

/// Record a validation failure in status and hand the error back
///
/// Infrastructure errors go straight to the error policy without touching
/// status, so API blips do not flap the phase.
async fn record_failure(
    ctx: &Context,
    user: &mut User,
    observed: &mut UserStatus,
    prefix: &str,
    err: Error,
) -> Error {
    if matches!(err, Error::Validation { .. }) {
        let failed = error_status(observed, format!("{}{}", prefix, err.detail()));
        if let Err(write_err) = write_status(ctx, user, observed, failed).await {
            warn!(error = %write_err, "failed to record error status");
        }
    }
    err
}

/// Ensure the per-user ServiceAccount exists in the working namespace
async fn ensure_service_account(user: &User, ctx: &Context) -> Result<(), Error> {
    let name = user.name_any();
    let namespace = &ctx.config.working_namespace;

    if ctx.kube.get_service_account(&name, namespace).await?.is_some() {
        return Ok(());
    }

    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([
                (USER_LABEL_KEY.to_string(), name.clone()),
                (
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_KUBEUSER.to_string(),
                ),
            ])),
            owner_references: user.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        ..Default::default()
    };

    info!(namespace = %namespace, "creating service account");
    match ctx.kube.create_service_account(&sa).await {
        Err(e) if e.is_conflict() => Ok(()),
        other => other,
    }
}
