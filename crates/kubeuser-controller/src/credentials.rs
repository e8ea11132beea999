//! Client-certificate credential lifecycle
//!
//! A User's credential moves through key, signing request, approval, signed
//! certificate and finally a kubeconfig Secret. The current step is inferred
//! from which artifacts exist, so each call advances at most one step that
//! depends on the signer and returns [`CredentialOutcome::Pending`] until the
//! signer has acted.
//!
//! The private key is generated once and never replaced. Rotation discards
//! the kubeconfig and signing request only, so the new certificate is issued
//! for the same key.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use kubeuser_common::crd::User;
use kubeuser_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBEUSER, USER_LABEL_KEY};
use kubeuser_pki::{
    build_csr, client_certificate_from_kubeconfig, generate_private_key, parse_certificate,
    Kubeconfig, ParsedCertificate, PkiError,
};

use crate::controller::Context;

/// Signer that issues client certificates trusted by the API server
pub const CLIENT_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

/// Key usage requested for the client certificate
pub const CLIENT_AUTH_USAGE: &str = "client auth";

/// Data key holding the PEM private key
pub const KEY_DATA_KEY: &str = "key.pem";

/// Data key holding the kubeconfig document
pub const KUBECONFIG_DATA_KEY: &str = "config";

/// Reason recorded on the approval condition
pub const APPROVAL_REASON: &str = "AutoApproved";

/// Message recorded on the approval condition
pub const APPROVAL_MESSAGE: &str = "Approved by kubeuser-operator";

/// Where a User's credential workflow stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialState {
    /// No signing request exists
    NoRequest,
    /// Request submitted, not yet approved
    RequestPending,
    /// Request approved, signer has not issued a certificate
    RequestApproved,
    /// Request denied or failed; carries the condition's explanation
    RequestRejected(String),
    /// Certificate issued and ready to publish
    Signed,
}

/// A certificate that backs the published kubeconfig
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Validity end of the certificate
    pub not_after: DateTime<Utc>,
    /// True if the kubeconfig was published during this call
    pub newly_issued: bool,
}

/// Result of one credential step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// A kubeconfig is published and valid beyond the rotation threshold
    Ready(IssuedCertificate),
    /// Waiting on the signer; carries the state reached in this call
    Pending(CredentialState),
}

fn pki_error(user: &str, stage: &str, err: PkiError) -> Error {
    Error::credential_in_stage(user, stage, err.to_string())
}

fn labels_for(user: &User) -> BTreeMap<String, String> {
    BTreeMap::from([
        (USER_LABEL_KEY.to_string(), user.name_any()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_KUBEUSER.to_string(),
        ),
    ])
}

fn owned_metadata(user: &User, name: String, namespace: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace,
        labels: Some(labels_for(user)),
        owner_references: user.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Infer the workflow state from the signing request, if any
///
/// Denied and Failed take precedence over anything else the request carries.
pub fn request_state(csr: Option<&CertificateSigningRequest>) -> CredentialState {
    let Some(csr) = csr else {
        return CredentialState::NoRequest;
    };
    let status = csr.status.as_ref();
    let conditions = status
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    if let Some(rejected) = conditions
        .iter()
        .find(|c| (c.type_ == "Denied" || c.type_ == "Failed") && c.status == "True")
    {
        let detail = rejected
            .message
            .clone()
            .or_else(|| rejected.reason.clone())
            .unwrap_or_default();
        return CredentialState::RequestRejected(format!("{}: {}", rejected.type_, detail));
    }

    let signed = status
        .and_then(|s| s.certificate.as_ref())
        .is_some_and(|c| !c.0.is_empty());
    if signed {
        return CredentialState::Signed;
    }

    if conditions
        .iter()
        .any(|c| c.type_ == "Approved" && c.status == "True")
    {
        CredentialState::RequestApproved
    } else {
        CredentialState::RequestPending
    }
}

/// Certificate embedded in a published kubeconfig Secret
pub fn published_certificate(secret: &Secret) -> Result<ParsedCertificate, PkiError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_DATA_KEY))
        .ok_or_else(|| PkiError::Kubeconfig(format!("secret has no {} key", KUBECONFIG_DATA_KEY)))?;
    let cert = client_certificate_from_kubeconfig(&data.0)?;
    parse_certificate(&cert)
}

/// Signing request for `user`, signed with `key_pem`
pub fn build_signing_request(user: &User, key_pem: &str) -> Result<CertificateSigningRequest, Error> {
    let name = user.name_any();
    let csr_pem = build_csr(&name, key_pem).map_err(|e| pki_error(&name, "csr", e))?;

    Ok(CertificateSigningRequest {
        metadata: owned_metadata(user, user.csr_name(), None),
        spec: CertificateSigningRequestSpec {
            request: ByteString(csr_pem.into_bytes()),
            signer_name: CLIENT_SIGNER_NAME.to_string(),
            usages: Some(vec![CLIENT_AUTH_USAGE.to_string()]),
            ..Default::default()
        },
        status: None,
    })
}

/// Copy of `csr` with an Approved condition appended
pub fn with_approval(csr: &CertificateSigningRequest, now: DateTime<Utc>) -> CertificateSigningRequest {
    let mut approved = csr.clone();
    let status = approved
        .status
        .get_or_insert_with(CertificateSigningRequestStatus::default);
    status
        .conditions
        .get_or_insert_with(Vec::new)
        .push(CertificateSigningRequestCondition {
            type_: "Approved".to_string(),
            status: "True".to_string(),
            reason: Some(APPROVAL_REASON.to_string()),
            message: Some(APPROVAL_MESSAGE.to_string()),
            last_update_time: Some(Time(now)),
            last_transition_time: None,
        });
    approved
}

/// Advance the credential workflow for `user` by one step
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn ensure_credentials(user: &User, ctx: &Context) -> Result<CredentialOutcome, Error> {
    let name = user.name_any();
    let namespace = &ctx.config.working_namespace;
    let kubeconfig_name = user.kubeconfig_secret_name();
    let threshold = TimeDelta::from_std(ctx.config.rotation_threshold).map_err(|e| {
        Error::internal_with_context("credentials", format!("invalid rotation threshold: {}", e))
    })?;

    let published = match ctx.kube.get_secret(&kubeconfig_name, namespace).await? {
        None => None,
        Some(secret) => match published_certificate(&secret) {
            Ok(cert) if !cert.expires_within(threshold, Utc::now()) => Some(cert),
            Ok(cert) => {
                info!(not_after = %cert.not_after, "client certificate inside rotation window, reissuing");
                retire_credential(user, ctx).await?;
                None
            }
            Err(e) => {
                warn!(error = %e, "published kubeconfig is unreadable, reissuing");
                retire_credential(user, ctx).await?;
                None
            }
        },
    };

    let key_pem = ensure_private_key(user, ctx).await?;

    if let Some(cert) = published {
        debug!(not_after = %cert.not_after, "kubeconfig already published");
        return Ok(CredentialOutcome::Ready(IssuedCertificate {
            not_after: cert.not_after,
            newly_issued: false,
        }));
    }

    let csr_name = user.csr_name();
    let csr = ctx.kube.get_csr(&csr_name).await?;

    match request_state(csr.as_ref()) {
        CredentialState::NoRequest => {
            let request = build_signing_request(user, &key_pem)?;
            info!(csr = %csr_name, "submitting certificate signing request");
            ctx.kube.create_csr(&request).await?;
            Ok(CredentialOutcome::Pending(CredentialState::RequestPending))
        }
        CredentialState::RequestRejected(reason) => {
            warn!(csr = %csr_name, %reason, "certificate signing request rejected");
            ctx.kube.delete_csr(&csr_name).await?;
            Err(Error::credential_in_stage(
                &name,
                "csr",
                format!("certificate signing request {} was rejected ({})", csr_name, reason),
            ))
        }
        CredentialState::RequestPending => {
            let Some(csr) = csr else {
                return Ok(CredentialOutcome::Pending(CredentialState::NoRequest));
            };
            info!(csr = %csr_name, "approving certificate signing request");
            ctx.kube.approve_csr(&with_approval(&csr, Utc::now())).await?;
            Ok(CredentialOutcome::Pending(CredentialState::RequestApproved))
        }
        CredentialState::RequestApproved => {
            debug!(csr = %csr_name, "waiting for signer");
            Ok(CredentialOutcome::Pending(CredentialState::RequestApproved))
        }
        CredentialState::Signed => {
            let certificate = csr
                .and_then(|c| c.status)
                .and_then(|s| s.certificate)
                .map(|c| c.0)
                .unwrap_or_default();
            let issued = publish_kubeconfig(user, ctx, &certificate, &key_pem).await?;
            Ok(CredentialOutcome::Ready(IssuedCertificate {
                not_after: issued.not_after,
                newly_issued: true,
            }))
        }
    }
}

/// Load the stored private key, generating and storing one on first use
async fn ensure_private_key(user: &User, ctx: &Context) -> Result<String, Error> {
    let name = user.name_any();
    let namespace = &ctx.config.working_namespace;
    let secret_name = user.key_secret_name();

    if let Some(secret) = ctx.kube.get_secret(&secret_name, namespace).await? {
        let key = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KEY_DATA_KEY))
            .ok_or_else(|| {
                Error::credential_in_stage(
                    &name,
                    "key",
                    format!("secret {} has no {} entry", secret_name, KEY_DATA_KEY),
                )
            })?;
        return String::from_utf8(key.0.clone()).map_err(|_| {
            Error::credential_in_stage(&name, "key", format!("secret {} holds a non-UTF-8 key", secret_name))
        });
    }

    info!(secret = %secret_name, "generating private key");
    let key_pem = generate_private_key().map_err(|e| pki_error(&name, "key", e))?;

    let secret = Secret {
        metadata: owned_metadata(user, secret_name, Some(namespace.clone())),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            KEY_DATA_KEY.to_string(),
            ByteString(key_pem.clone().into_bytes()),
        )])),
        ..Default::default()
    };
    ctx.kube.create_secret(&secret).await?;
    Ok(key_pem)
}

/// Drop the kubeconfig and signing request so a fresh certificate is issued
async fn retire_credential(user: &User, ctx: &Context) -> Result<(), Error> {
    ctx.kube
        .delete_secret(&user.kubeconfig_secret_name(), &ctx.config.working_namespace)
        .await?;
    ctx.kube.delete_csr(&user.csr_name()).await
}

/// Cluster CA bundle embedded in the kubeconfig
///
/// The mounted service-account CA is preferred; the cluster's root CA
/// ConfigMap is the fallback.
async fn load_trust_anchor(user: &User, ctx: &Context) -> Result<Vec<u8>, Error> {
    let path = &ctx.config.in_cluster_ca_path;
    match tokio::fs::read(path).await {
        Ok(data) if !data.is_empty() => return Ok(data),
        Ok(_) => debug!(path = %path.display(), "mounted CA bundle is empty"),
        Err(e) => debug!(path = %path.display(), error = %e, "mounted CA bundle unavailable"),
    }

    let config_map = ctx
        .kube
        .get_config_map(&ctx.config.root_ca_config_map, &ctx.config.root_ca_namespace)
        .await?;
    config_map
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(&ctx.config.root_ca_key))
        .filter(|ca| !ca.is_empty())
        .map(String::into_bytes)
        .ok_or_else(|| {
            Error::credential_in_stage(
                user.name_any(),
                "kubeconfig",
                format!(
                    "cluster CA not found at {} or in configmap {}/{}",
                    path.display(),
                    ctx.config.root_ca_namespace,
                    ctx.config.root_ca_config_map
                ),
            )
        })
}

/// Assemble and store the kubeconfig for a signed certificate
async fn publish_kubeconfig(
    user: &User,
    ctx: &Context,
    certificate: &[u8],
    key_pem: &str,
) -> Result<ParsedCertificate, Error> {
    let name = user.name_any();
    let parsed = parse_certificate(certificate).map_err(|e| pki_error(&name, "certificate", e))?;
    debug!(encoding = ?parsed.encoding, not_after = %parsed.not_after, "parsed signed certificate");

    let ca = load_trust_anchor(user, ctx).await?;
    let kubeconfig = Kubeconfig::for_client_certificate(
        &ctx.config.api_server,
        &ca,
        &parsed.to_pem(),
        key_pem,
        &name,
    );
    let yaml = kubeconfig
        .to_yaml()
        .map_err(|e| pki_error(&name, "kubeconfig", e))?;

    let secret = Secret {
        metadata: owned_metadata(
            user,
            user.kubeconfig_secret_name(),
            Some(ctx.config.working_namespace.clone()),
        ),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_DATA_KEY.to_string(),
            ByteString(yaml.into_bytes()),
        )])),
        ..Default::default()
    };

    info!(secret = %user.kubeconfig_secret_name(), "publishing kubeconfig");
    match ctx.kube.create_secret(&secret).await {
        Err(e) if e.is_conflict() => {
            debug!("kubeconfig already published by a concurrent pass");
        }
        other => other?,
    }
    Ok(parsed)
}
