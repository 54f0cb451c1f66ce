use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use glbc::cli::{
    format_backend_health, format_backend_list, format_load_balancer_list, format_plan,
    format_sync_report, CloudArgs, Cli, Commands, GetArgs, GetResource, RunArgs, SyncArgs,
    ValidateArgs,
};
use glbc::cloud::fake::FakeCloud;
use glbc::cloud::gce::ComputeClient;
use glbc::cluster::{ClusterManager, ManagerOptions, SyncContext};
use glbc::config::{load_or_default, ControllerConfig};
use glbc::controller::{run_cycle, spawn_controller, ControllerOptions};
use glbc::server::{create_router, AppState};
use glbc::state::{ClusterStateSource, FileStateSource};
use glbc::utils::Namer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = load_or_default(config_path.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Run(args) => run_controller(config, args).await,
        Commands::Sync(args) => sync_once(config, args).await,
        Commands::Validate(args) => validate(config, args).await,
        Commands::Get(args) => get(config, args).await,
        Commands::DeleteAll(cloud) => delete_all(config, cloud).await,
    }
}

/// Build a cluster manager on the provider selected by `cloud`.
fn build_manager(config: &ControllerConfig, cloud: &CloudArgs) -> Result<Arc<ClusterManager>> {
    if let Some(ref env_file) = cloud.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }
    config.validate(!cloud.fake_cloud)?;

    let options = ManagerOptions::from(config);
    let manager = if cloud.fake_cloud {
        warn!("Using the in-memory provider; nothing is created in the cloud");
        ClusterManager::new(Arc::new(FakeCloud::new()), options)
    } else {
        let client = ComputeClient::from_config(config).context("Failed to create API client")?;
        ClusterManager::new(Arc::new(client), options)
    };
    Ok(Arc::new(manager))
}

fn state_source(path: &Path) -> FileStateSource {
    FileStateSource::new(path.to_string_lossy())
}

async fn run_controller(config: ControllerConfig, args: RunArgs) -> Result<()> {
    let manager = build_manager(&config, &args.cloud)?;
    let source: Arc<dyn ClusterStateSource> = Arc::new(state_source(&args.state));
    let options = ControllerOptions::from(&config);
    let state = AppState::new(manager.clone());

    let addr = args.status_addr.unwrap_or_else(|| config.status_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Cluster {} in zone {}", config.cluster_name, config.zone);
    info!("Desired state from {}", args.state.display());
    info!("Diagnostics server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /healthz          - Liveness");
    info!("  GET  /status           - Last sync outcome");
    info!("  GET  /urlmap           - Routes of the last sync");
    info!("  GET  /backends/{{port}}  - Instance health behind a backend");

    let (cancel, controller) = spawn_controller(manager.clone(), source, state.clone(), options);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = controller.await {
        warn!("Controller task ended abnormally: {}", e);
    }
    match server.await {
        Ok(Err(e)) => warn!("Server error: {}", e),
        Err(e) => warn!("Server task ended abnormally: {}", e),
        Ok(Ok(())) => {}
    }

    if args.delete_all_on_exit {
        let ctx = SyncContext::new(CancellationToken::new(), config.cycle_deadline());
        let report = manager.shutdown(&ctx).await?;
        info!(
            "Deleted {} resource(s), {} deferred",
            report.deleted.len(),
            report.deferred.len()
        );
    }
    Ok(())
}

async fn sync_once(config: ControllerConfig, args: SyncArgs) -> Result<()> {
    let manager = build_manager(&config, &args.cloud)?;
    let source = state_source(&args.state);
    let options = ControllerOptions::from(&config);

    let report = run_cycle(&manager, &source, &options, &CancellationToken::new()).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_sync_report(&report));
    }
    Ok(())
}

async fn validate(config: ControllerConfig, args: ValidateArgs) -> Result<()> {
    let desired = state_source(&args.state).desired_state().await?;
    desired.validate()?;
    let specs = desired.load_balancer_specs(config.default_backend_port)?;

    println!(
        "{}: valid, {} node(s), {} ingress(es)\n",
        args.state.display(),
        desired.nodes.len(),
        desired.ingresses.len()
    );
    print!("{}", format_plan(&specs, &Namer::new(config.cluster_name.as_str())));
    Ok(())
}

async fn get(config: ControllerConfig, args: GetArgs) -> Result<()> {
    let manager = build_manager(&config, &args.cloud)?;

    match args.resource {
        GetResource::Backends => {
            let backends = manager.backend_pool().list_owned().await?;
            print!("{}", format_backend_list(&backends));
        }
        GetResource::LoadBalancers => {
            let pool = manager.load_balancer_pool();
            let mut lbs = Vec::new();
            for name in pool.list_owned().await? {
                lbs.push(pool.get(&name).await?);
            }
            print!("{}", format_load_balancer_list(&lbs));
        }
        GetResource::Health { port } => {
            let health = manager.backend_status(port).await?;
            print!("{}", format_backend_health(&health));
        }
    }
    Ok(())
}

async fn delete_all(config: ControllerConfig, cloud: CloudArgs) -> Result<()> {
    let manager = build_manager(&config, &cloud)?;
    let ctx = SyncContext::new(CancellationToken::new(), config.cycle_deadline());
    let report = manager.shutdown(&ctx).await?;

    for name in &report.deleted {
        println!("deleted {}", name);
    }
    for name in &report.deferred {
        println!("still in use {}", name);
    }
    Ok(())
}
