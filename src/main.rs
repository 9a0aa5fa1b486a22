//! Tether demo operator - reconciles Workspace resources on a live cluster

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether::config::EngineConfig;
use tether::controller::{Context, Reconciler};
use tether::crd::Workspace;
use tether::finalizer::finalizer_fn;
use tether::object::WatchScope;
use tether::operator::Operator;
use tether::retry::{retry_with_backoff, RetryConfig};
use tether::store::{KubeStore, ObjectStore};
use tether::telemetry::{init_logging, LogFormat};

/// Finalizer releasing a workspace's storage before it is removed
const CLEANUP_FINALIZER: &str = "workspaces.tether.dev/cleanup";

/// Tether - reconciliation and finalizer engine demo operator
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "TETHER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the Workspace CRD manifest and exit
    Crd,

    /// Watch Workspace resources and reconcile them until interrupted
    Run(RunArgs),
}

/// Run mode arguments
#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch (all namespaces if unset)
    #[arg(long, env = "TETHER_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum number of objects reconciled concurrently
    #[arg(long, env = "TETHER_WORKERS", default_value_t = tether::config::DEFAULT_WORKERS)]
    workers: usize,

    /// Timeout for a single API call in seconds
    #[arg(long, env = "TETHER_OPERATION_TIMEOUT_SECS", default_value = "30")]
    operation_timeout_secs: u64,

    /// Re-present every object at this interval in seconds (disabled if unset)
    #[arg(long, env = "TETHER_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// Install or update the Workspace CRD before starting
    #[arg(long, env = "TETHER_INSTALL_CRD")]
    install_crd: bool,
}

/// Demo business logic: every workspace carries the cleanup finalizer
struct WorkspaceReconciler;

#[async_trait::async_trait]
impl Reconciler<Workspace> for WorkspaceReconciler {
    async fn reconcile(&self, ws: Workspace, ctx: &Context<Workspace>) -> tether::Result<()> {
        let ws = ctx.attach(CLEANUP_FINALIZER, &ws).await?;
        info!(
            workspace = %ws.name_any(),
            namespace = ?ws.namespace(),
            owner = %ws.spec.owner,
            "workspace reconciled"
        );
        Ok(())
    }

    async fn deleted(&self, ws: Workspace, _ctx: &Context<Workspace>) -> tether::Result<()> {
        info!(workspace = %ws.name_any(), "workspace gone");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Commands::Crd => {
            let crd = serde_yaml::to_string(&Workspace::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Commands::Run(args) => run_operator(args).await,
    }
}

/// Run the Workspace operator until Ctrl-C
async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    let client = retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "create kubernetes client",
        Client::try_default,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let scope = match args.namespace {
        Some(ns) => WatchScope::namespace(ns),
        None => WatchScope::All,
    };
    let mut config = EngineConfig::default()
        .workers(args.workers)
        .operation_timeout(Duration::from_secs(args.operation_timeout_secs));
    if let Some(secs) = args.resync_secs {
        config = config.resync_every(Duration::from_secs(secs));
    }

    let cleanup = finalizer_fn(|ws: Workspace| async move {
        info!(
            workspace = %ws.name_any(),
            owner = %ws.spec.owner,
            retention_days = ?ws.spec.retention_days,
            "releasing workspace storage"
        );
        Ok::<_, tether::Error>(())
    });

    let store: Arc<dyn ObjectStore<Workspace>> = Arc::new(KubeStore::<Workspace>::new(client));
    let operator = Operator::builder(store, WorkspaceReconciler)
        .scope(scope)
        .config(config)
        .finalizer(CLEANUP_FINALIZER, cleanup)
        .build()?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, shutting down"),
        }
        on_signal.cancel();
    });

    operator.run(shutdown).await;
    Ok(())
}

/// Install or update the Workspace CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("tether").force();

    info!("Installing Workspace CRD...");
    crds.patch(
        "workspaces.tether.dev",
        &params,
        &Patch::Apply(&Workspace::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Workspace CRD: {}", e))?;

    info!("Workspace CRD installed/updated");
    Ok(())
}
