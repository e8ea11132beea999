//! kubeuser operator - client-certificate users backed by RBAC bindings

mod controller_runner;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use kubeuser_common::crd::User;
use kubeuser_common::telemetry::{init_telemetry, TelemetryConfig};
use kubeuser_common::FIELD_MANAGER;
use kubeuser_controller::config::API_SERVER_ENV;
use kubeuser_controller::UserControllerConfig;

/// kubeuser - turns User resources into RoleBindings and kubeconfigs
#[derive(Parser, Debug)]
#[command(name = "kubeuser", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// API server URL written into issued kubeconfigs
    #[arg(long, env = API_SERVER_ENV)]
    api_server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

impl Cli {
    /// Only the API server endpoint is taken from the command line; the
    /// working namespace and rotation threshold are fixed.
    fn controller_config(&self) -> UserControllerConfig {
        UserControllerConfig::default().with_api_server(self.api_server.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&User::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller_config()).await,
    }
}

/// Ensure the User CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing User CRD...");
    crds.patch("users.auth.openkube.io", &params, &Patch::Apply(&User::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install User CRD: {}", e))?;

    tracing::info!("User CRD installed/updated");
    Ok(())
}

async fn run_controller(config: UserControllerConfig) -> anyhow::Result<()> {
    tracing::info!("kubeuser controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    controller_runner::build_user_controller(client, config).await;

    tracing::info!("kubeuser controller shut down");
    Ok(())
}
