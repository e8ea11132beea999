//! Controller runner - builds the User controller future
//!
//! Kept separate from `main` so construction stays free of process setup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kubeuser_common::crd::User;
use kubeuser_common::USER_LABEL_KEY;
use kubeuser_controller::{error_policy, reconcile, Context, UserControllerConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn owned_watch() -> WatcherConfig {
    WatcherConfig::default()
        .timeout(WATCH_TIMEOUT_SECS)
        .labels(USER_LABEL_KEY)
}

/// Build the User controller future
///
/// Owned bindings, secrets, service accounts and signing requests map back
/// to their User, so drift and signer progress trigger a reconcile without
/// waiting for resync.
pub fn build_user_controller(
    client: Client,
    config: UserControllerConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let users: Api<User> = Api::all(client.clone());
    let role_bindings: Api<RoleBinding> = Api::all(client.clone());
    let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.working_namespace);
    let service_accounts: Api<ServiceAccount> =
        Api::namespaced(client.clone(), &config.working_namespace);
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());

    tracing::info!(
        namespace = %config.working_namespace,
        api_server = %config.api_server,
        "- User controller"
    );
    let ctx = Arc::new(Context::with_config(client, config));

    Box::pin(
        Controller::new(users, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(role_bindings, owned_watch())
            .owns(cluster_role_bindings, owned_watch())
            .owns(secrets, owned_watch())
            .owns(service_accounts, owned_watch())
            .owns(csrs, owned_watch())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("User")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_watches_only_see_labelled_objects() {
        let watch = owned_watch();
        assert_eq!(watch.label_selector.as_deref(), Some(USER_LABEL_KEY));
        assert_eq!(watch.timeout, Some(WATCH_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn controller_builds_without_contacting_the_cluster() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let config = kube::Config::new("http://127.0.0.1:1".parse().expect("uri"));
        let client = Client::try_from(config).expect("client");

        let controller = build_user_controller(client, UserControllerConfig::default());
        drop(controller);
    }
}
