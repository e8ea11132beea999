//! In-memory API server stand-in for multi-pass reconcile tests
//!
//! Mocks are used where a test pins down individual calls; this fake is used
//! where a test drives several passes and asserts on the resulting cluster
//! state. It includes a toy signer that issues certificates for approved
//! requests when asked.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::ResourceExt;

use kubeuser_common::crd::{ClusterRoleSpec, RoleSpec, User, UserSpec, UserStatus};
use kubeuser_common::Error;

use crate::config::UserControllerConfig;
use crate::controller::KubeClient;

/// Configuration pointing at a CA path that never exists
pub(crate) fn test_config() -> UserControllerConfig {
    UserControllerConfig {
        api_server: "https://test-apiserver:6443".to_string(),
        in_cluster_ca_path: PathBuf::from("/nonexistent/kubeuser-test/ca.crt"),
        ..Default::default()
    }
}

/// A persisted-looking User with uid and creation time set
pub(crate) fn user_with(
    name: &str,
    roles: &[(&str, &str)],
    cluster_roles: &[&str],
    expiry: Option<&str>,
) -> User {
    let mut user = User::new(name, spec_with(roles, cluster_roles, expiry));
    user.metadata.uid = Some(format!("uid-{}", name));
    user.metadata.resource_version = Some("1".to_string());
    user.metadata.creation_timestamp = Some(Time(Utc::now()));
    user
}

fn spec_with(roles: &[(&str, &str)], cluster_roles: &[&str], expiry: Option<&str>) -> UserSpec {
    UserSpec {
        roles: roles
            .iter()
            .map(|(ns, role)| RoleSpec {
                namespace: ns.to_string(),
                existing_role: role.to_string(),
            })
            .collect(),
        cluster_roles: cluster_roles
            .iter()
            .map(|cr| ClusterRoleSpec {
                existing_cluster_role: cr.to_string(),
            })
            .collect(),
        expiry: expiry.map(str::to_string),
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn already_exists(kind: &str, name: &str) -> Error {
    api_error(409, "AlreadyExists", format!("{} {} already exists", kind, name))
}

fn stale(kind: &str, name: &str) -> Error {
    api_error(
        409,
        "Conflict",
        format!("{} {} has been modified; please apply your changes to the latest version", kind, name),
    )
}

/// A write guarded by `sent` is stale when it names a version other than the stored one
fn is_stale(sent: Option<&str>, stored: Option<&str>) -> bool {
    sent.is_some() && sent != stored
}

/// How the toy signer encodes issued certificates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignerEncoding {
    Pem,
    Base64Pem,
    Der,
    Garbage,
}

type Namespaced = (String, String);

struct State {
    users: BTreeMap<String, User>,
    roles: BTreeSet<Namespaced>,
    cluster_roles: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    service_accounts: BTreeMap<Namespaced, ServiceAccount>,
    role_bindings: BTreeMap<Namespaced, RoleBinding>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    secrets: BTreeMap<Namespaced, Secret>,
    csrs: BTreeMap<String, CertificateSigningRequest>,
    config_maps: BTreeMap<Namespaced, ConfigMap>,
    writes: Vec<String>,
    csr_creates: usize,
    resource_version: u64,
    signer_encoding: SignerEncoding,
    signer_not_after: Option<DateTime<Utc>>,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory implementation of [`KubeClient`]
pub(crate) struct FakeKube {
    state: Mutex<State>,
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let Some((key, value)) = selector.split_once('=') else {
        return false;
    };
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .is_some_and(|v| v == value)
}

fn nn(namespace: &str, name: &str) -> Namespaced {
    (namespace.to_string(), name.to_string())
}

impl FakeKube {
    /// Empty cluster with the root CA ConfigMap present
    pub(crate) fn new() -> Self {
        let root_ca = ConfigMap {
            metadata: ObjectMeta {
                name: Some("kube-root-ca.crt".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "ca.crt".to_string(),
                "-----BEGIN CERTIFICATE-----\nTESTCA\n-----END CERTIFICATE-----\n".to_string(),
            )])),
            ..Default::default()
        };
        Self {
            state: Mutex::new(State {
                users: BTreeMap::new(),
                roles: BTreeSet::new(),
                cluster_roles: BTreeSet::new(),
                namespaces: BTreeSet::from(["default".to_string()]),
                service_accounts: BTreeMap::new(),
                role_bindings: BTreeMap::new(),
                cluster_role_bindings: BTreeMap::new(),
                secrets: BTreeMap::new(),
                csrs: BTreeMap::new(),
                config_maps: BTreeMap::from([(nn("default", "kube-root-ca.crt"), root_ca)]),
                writes: Vec::new(),
                csr_creates: 0,
                resource_version: 100,
                signer_encoding: SignerEncoding::Pem,
                signer_not_after: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake state lock")
    }

    pub(crate) fn add_role(&self, namespace: &str, name: &str) {
        self.lock().roles.insert(nn(namespace, name));
    }

    pub(crate) fn add_cluster_role(&self, name: &str) {
        self.lock().cluster_roles.insert(name.to_string());
    }

    pub(crate) fn add_user(&self, user: User) {
        self.lock().users.insert(user.name_any(), user);
    }

    pub(crate) fn user(&self, name: &str) -> Option<User> {
        self.lock().users.get(name).cloned()
    }

    pub(crate) fn update_spec(&self, name: &str, roles: &[(&str, &str)], cluster_roles: &[&str]) {
        let mut state = self.lock();
        let rv = state.next_rv();
        let user = state.users.get_mut(name).expect("user exists");
        user.spec = spec_with(roles, cluster_roles, user.spec.expiry.as_deref());
        user.metadata.resource_version = Some(rv);
    }

    /// Another controller adds its own finalizer, bumping the resourceVersion
    pub(crate) fn add_foreign_finalizer(&self, name: &str, finalizer: &str) {
        let mut state = self.lock();
        let rv = state.next_rv();
        let user = state.users.get_mut(name).expect("user exists");
        user.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        user.metadata.resource_version = Some(rv);
    }

    pub(crate) fn mark_deleted(&self, name: &str) {
        let mut state = self.lock();
        let user = state.users.get_mut(name).expect("user exists");
        user.metadata.deletion_timestamp = Some(Time(Utc::now()));
    }

    pub(crate) fn remove_root_ca(&self) {
        self.lock()
            .config_maps
            .remove(&nn("default", "kube-root-ca.crt"));
    }

    pub(crate) fn set_signer_encoding(&self, encoding: SignerEncoding) {
        self.lock().signer_encoding = encoding;
    }

    pub(crate) fn set_signer_not_after(&self, not_after: DateTime<Utc>) {
        self.lock().signer_not_after = Some(not_after);
    }

    pub(crate) fn has_role_binding(&self, namespace: &str, name: &str) -> bool {
        self.lock().role_bindings.contains_key(&nn(namespace, name))
    }

    pub(crate) fn has_cluster_role_binding(&self, name: &str) -> bool {
        self.lock().cluster_role_bindings.contains_key(name)
    }

    pub(crate) fn role_binding_count(&self) -> usize {
        self.lock().role_bindings.len()
    }

    pub(crate) fn cluster_role_binding_count(&self) -> usize {
        self.lock().cluster_role_bindings.len()
    }

    pub(crate) fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&nn(namespace, name)).cloned()
    }

    pub(crate) fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.secret(namespace, name).is_some()
    }

    pub(crate) fn has_service_account(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .service_accounts
            .contains_key(&nn(namespace, name))
    }

    pub(crate) fn has_csr(&self, name: &str) -> bool {
        self.lock().csrs.contains_key(name)
    }

    pub(crate) fn csr_create_count(&self) -> usize {
        self.lock().csr_creates
    }

    pub(crate) fn csr_is_approved(&self, name: &str) -> bool {
        self.lock()
            .csrs
            .get(name)
            .and_then(|c| c.status.as_ref())
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Approved"))
    }

    pub(crate) fn deny_csr(&self, name: &str) {
        let mut state = self.lock();
        let csr = state.csrs.get_mut(name).expect("csr exists");
        let status = csr.status.get_or_insert_with(Default::default);
        status.conditions.get_or_insert_with(Vec::new).push(
            k8s_openapi::api::certificates::v1::CertificateSigningRequestCondition {
                type_: "Denied".to_string(),
                status: "True".to_string(),
                reason: Some("PolicyViolation".to_string()),
                message: Some("identity not allowed".to_string()),
                ..Default::default()
            },
        );
    }

    /// Issue certificates for every approved, unsigned request
    pub(crate) fn sign_approved_csrs(&self, validity: TimeDelta) {
        let mut state = self.lock();
        let encoding = state.signer_encoding;
        let not_after = state
            .signer_not_after
            .unwrap_or_else(|| Utc::now() + validity);

        for (name, csr) in state.csrs.iter_mut() {
            let status = csr.status.get_or_insert_with(Default::default);
            let conditions = status.conditions.as_deref().unwrap_or_default();
            let approved = conditions.iter().any(|c| c.type_ == "Approved");
            let rejected = conditions
                .iter()
                .any(|c| c.type_ == "Denied" || c.type_ == "Failed");
            if !approved || rejected || status.certificate.is_some() {
                continue;
            }
            let identity = name.trim_end_matches("-csr");
            status.certificate = Some(ByteString(issue_certificate(identity, not_after, encoding)));
        }
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.lock().writes.len()
    }
}

fn issue_certificate(identity: &str, not_after: DateTime<Utc>, encoding: SignerEncoding) -> Vec<u8> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let key = KeyPair::generate().expect("signer key");
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity);
    params.distinguished_name = dn;
    params.not_before = ::time::OffsetDateTime::now_utc() - ::time::Duration::hours(1);
    params.not_after = ::time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .expect("valid not_after");
    let cert = params.self_signed(&key).expect("self-signed certificate");

    match encoding {
        SignerEncoding::Pem => cert.pem().into_bytes(),
        SignerEncoding::Base64Pem => STANDARD.encode(cert.pem()).into_bytes(),
        SignerEncoding::Der => cert.der().to_vec(),
        SignerEncoding::Garbage => b"definitely not a certificate".to_vec(),
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_user(&self, name: &str) -> Result<Option<User>, Error> {
        Ok(self.user(name))
    }

    async fn patch_user_status(
        &self,
        name: &str,
        status: &UserStatus,
    ) -> Result<Option<String>, Error> {
        let mut state = self.lock();
        let rv = state.next_rv();
        let user = state
            .users
            .get_mut(name)
            .ok_or_else(|| api_error(404, "NotFound", format!("user {} not found", name)))?;
        user.status = Some(status.clone());
        user.metadata.resource_version = Some(rv.clone());
        state.writes.push(format!("status:{}", name));
        Ok(Some(rv))
    }

    async fn add_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let rv = state.next_rv();
        let name = user.name_any();
        let stored = state
            .users
            .get_mut(&name)
            .ok_or_else(|| api_error(404, "NotFound", format!("user {} not found", name)))?;
        if is_stale(
            user.metadata.resource_version.as_deref(),
            stored.metadata.resource_version.as_deref(),
        ) {
            return Err(stale("user", &name));
        }
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        stored.metadata.resource_version = Some(rv);
        state.writes.push(format!("finalizer+:{}", name));
        Ok(())
    }

    async fn remove_user_finalizer(&self, user: &User, finalizer: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let name = user.name_any();
        let rv = state.next_rv();
        let Some(stored) = state.users.get_mut(&name) else {
            return Ok(());
        };
        if is_stale(
            user.metadata.resource_version.as_deref(),
            stored.metadata.resource_version.as_deref(),
        ) {
            return Err(stale("user", &name));
        }
        stored.metadata.resource_version = Some(rv);
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        let released = stored.finalizers().is_empty() && stored.metadata.deletion_timestamp.is_some();
        if released {
            state.users.remove(&name);
        }
        state.writes.push(format!("finalizer-:{}", name));
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.namespaces.insert(name.to_string()) {
            state.writes.push(format!("namespace:{}", name));
        }
        Ok(())
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        Ok(self.lock().service_accounts.get(&nn(namespace, name)).cloned())
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        let mut state = self.lock();
        let key = nn(&sa.namespace().unwrap_or_default(), &sa.name_any());
        if state.service_accounts.contains_key(&key) {
            return Err(already_exists("serviceaccount", &key.1));
        }
        state.writes.push(format!("sa+:{}/{}", key.0, key.1));
        state.service_accounts.insert(key, sa.clone());
        Ok(())
    }

    async fn delete_service_account(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.service_accounts.remove(&nn(namespace, name)).is_some() {
            state.writes.push(format!("sa-:{}/{}", namespace, name));
        }
        Ok(())
    }

    async fn role_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        Ok(self.lock().roles.contains(&nn(namespace, name)))
    }

    async fn cluster_role_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.lock().cluster_roles.contains(name))
    }

    async fn list_role_bindings(&self, label_selector: &str) -> Result<Vec<RoleBinding>, Error> {
        Ok(self
            .lock()
            .role_bindings
            .values()
            .filter(|rb| matches_selector(&rb.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let mut state = self.lock();
        let key = nn(&binding.namespace().unwrap_or_default(), &binding.name_any());
        if state.role_bindings.contains_key(&key) {
            return Err(already_exists("rolebinding", &key.1));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(state.next_rv());
        state.writes.push(format!("rb+:{}/{}", key.0, key.1));
        state.role_bindings.insert(key, stored);
        Ok(())
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let mut state = self.lock();
        let key = nn(&binding.namespace().unwrap_or_default(), &binding.name_any());
        let current_rv = state
            .role_bindings
            .get(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("rolebinding {} not found", key.1)))?
            .metadata
            .resource_version
            .clone();
        if current_rv != binding.metadata.resource_version {
            return Err(api_error(409, "Conflict", "stale resourceVersion".to_string()));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(state.next_rv());
        state.writes.push(format!("rb~:{}/{}", key.0, key.1));
        state.role_bindings.insert(key, stored);
        Ok(())
    }

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.role_bindings.remove(&nn(namespace, name)).is_some() {
            state.writes.push(format!("rb-:{}/{}", namespace, name));
        }
        Ok(())
    }

    async fn list_cluster_role_bindings(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error> {
        Ok(self
            .lock()
            .cluster_role_bindings
            .values()
            .filter(|crb| matches_selector(&crb.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let name = binding.name_any();
        if state.cluster_role_bindings.contains_key(&name) {
            return Err(already_exists("clusterrolebinding", &name));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(state.next_rv());
        state.writes.push(format!("crb+:{}", name));
        state.cluster_role_bindings.insert(name, stored);
        Ok(())
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let name = binding.name_any();
        let current_rv = state
            .cluster_role_bindings
            .get(&name)
            .ok_or_else(|| api_error(404, "NotFound", format!("clusterrolebinding {} not found", name)))?
            .metadata
            .resource_version
            .clone();
        if current_rv != binding.metadata.resource_version {
            return Err(api_error(409, "Conflict", "stale resourceVersion".to_string()));
        }
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(state.next_rv());
        state.writes.push(format!("crb~:{}", name));
        state.cluster_role_bindings.insert(name, stored);
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.cluster_role_bindings.remove(name).is_some() {
            state.writes.push(format!("crb-:{}", name));
        }
        Ok(())
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let mut state = self.lock();
        let key = nn(&secret.namespace().unwrap_or_default(), &secret.name_any());
        if state.secrets.contains_key(&key) {
            return Err(already_exists("secret", &key.1));
        }
        state.writes.push(format!("secret+:{}/{}", key.0, key.1));
        state.secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.secrets.remove(&nn(namespace, name)).is_some() {
            state.writes.push(format!("secret-:{}/{}", namespace, name));
        }
        Ok(())
    }

    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        Ok(self.lock().csrs.get(name).cloned())
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        let mut state = self.lock();
        let name = csr.name_any();
        if state.csrs.contains_key(&name) {
            return Err(already_exists("certificatesigningrequest", &name));
        }
        state.csr_creates += 1;
        state.writes.push(format!("csr+:{}", name));
        state.csrs.insert(name, csr.clone());
        Ok(())
    }

    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        let mut state = self.lock();
        let name = csr.name_any();
        let stored = state.csrs.get_mut(&name).ok_or_else(|| {
            api_error(404, "NotFound", format!("certificatesigningrequest {} not found", name))
        })?;
        let conditions = csr.status.as_ref().and_then(|s| s.conditions.clone());
        stored.status.get_or_insert_with(Default::default).conditions = conditions;
        state.writes.push(format!("csr~:{}", name));
        Ok(())
    }

    async fn delete_csr(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.csrs.remove(name).is_some() {
            state.writes.push(format!("csr-:{}", name));
        }
        Ok(())
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.lock().config_maps.get(&nn(namespace, name)).cloned())
    }
}
