//! Teardown of everything a User owns
//!
//! Runs while the finalizer holds the User in place. Each deletion is
//! attempted independently and failures are logged, so one stuck object
//! does not keep the rest alive. Removing the finalizer is the only step
//! whose failure is returned.

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use kubeuser_common::crd::User;
use kubeuser_common::{user_label_selector, Error, USER_FINALIZER};

use crate::bindings::ManagedBinding;
use crate::controller::{Context, KubeClient};

/// Delete every labelled binding of kind `B`, returning how many deletes failed
async fn delete_labelled<B: ManagedBinding>(kube: &dyn KubeClient, selector: &str) -> usize {
    let bindings = match B::list(kube, selector).await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(kind = B::KIND, error = %e, "failed to list bindings for cleanup");
            return 1;
        }
    };

    let mut failed = 0;
    for binding in bindings {
        if let Err(e) = B::delete(kube, &binding).await {
            warn!(
                kind = B::KIND,
                name = ?binding.object_meta().name,
                error = %e,
                "failed to delete binding"
            );
            failed += 1;
        }
    }
    failed
}

fn note(failed: &mut usize, what: &str, result: Result<(), Error>) {
    if let Err(e) = result {
        warn!(resource = what, error = %e, "cleanup step failed");
        *failed += 1;
    }
}

/// Remove bindings, credentials and the service account, then the finalizer
///
/// Returns the number of best-effort steps that failed.
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn cleanup_user(user: &User, ctx: &Context) -> Result<usize, Error> {
    let name = user.name_any();
    let kube = ctx.kube.as_ref();
    let namespace = &ctx.config.working_namespace;
    let selector = user_label_selector(&name);
    info!("cleaning up user resources");

    let mut failed = delete_labelled::<RoleBinding>(kube, &selector).await;
    failed += delete_labelled::<ClusterRoleBinding>(kube, &selector).await;

    note(
        &mut failed,
        "kubeconfig secret",
        kube.delete_secret(&user.kubeconfig_secret_name(), namespace)
            .await,
    );
    note(
        &mut failed,
        "key secret",
        kube.delete_secret(&user.key_secret_name(), namespace).await,
    );
    note(
        &mut failed,
        "certificate signing request",
        kube.delete_csr(&user.csr_name()).await,
    );
    note(
        &mut failed,
        "service account",
        kube.delete_service_account(&name, namespace).await,
    );

    if failed > 0 {
        warn!(failed, "some user resources could not be deleted");
    }

    kube.remove_user_finalizer(user, USER_FINALIZER).await?;
    info!("finalizer removed");
    Ok(failed)
}
