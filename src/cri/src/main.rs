//! vmpod CRI - Kubernetes Container Runtime Interface binary.
//!
//! Serves CRI RuntimeService (and, with an image provider, ImageService) over
//! a Unix domain socket, running each pod sandbox as a VM of the selected
//! backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmpod_runtime::agent::{GrpcAgentConnector, DEFAULT_AGENT_PORT};
use vmpod_runtime::provider::{ProviderContext, ProviderRegistry};

use vmpod_cri::server::CriServer;

/// vmpod CRI Runtime
#[derive(Parser, Debug)]
#[command(name = "vmpod-cri", about = "vmpod CRI Runtime", version)]
struct Args {
    /// Path to the Unix domain socket for CRI communication.
    #[arg(long, default_value = "/var/run/vmpod/vmpod.sock")]
    socket: PathBuf,

    /// Backend running the sandbox VMs (aws, gcp, virtualbox).
    #[arg(long)]
    pod_provider: String,

    /// Image catalog served through the CRI ImageService (aws, gcp).
    #[arg(long)]
    image_provider: Option<String>,

    /// Directory holding per-backend configuration files.
    #[arg(long, default_value = "~/.vmpod")]
    config_dir: String,

    /// Port of the agent inside each sandbox VM.
    #[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// Seconds to keep retrying the agent of a new sandbox.
    #[arg(long, default_value_t = 30)]
    agent_connect_timeout: u64,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn expand_home(path: &str) -> PathBuf {
    if path.starts_with('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(path.strip_prefix("~/").unwrap_or(""))
    } else {
        PathBuf::from(path)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config_dir = expand_home(&args.config_dir);

    tracing::info!(
        socket = %args.socket.display(),
        pod_provider = %args.pod_provider,
        image_provider = args.image_provider.as_deref().unwrap_or("none"),
        config_dir = %config_dir.display(),
        "Starting vmpod CRI Runtime"
    );

    let registry = ProviderRegistry::with_builtin().context("Failed to register providers")?;
    let ctx = ProviderContext {
        config_dir,
        connector: Arc::new(GrpcAgentConnector::new(
            args.agent_port,
            Duration::from_secs(args.agent_connect_timeout),
        )),
    };

    let pods = registry
        .pod_provider(&args.pod_provider, ctx.clone())
        .await
        .with_context(|| format!("Failed to start pod provider '{}'", args.pod_provider))?;

    let images = match &args.image_provider {
        Some(name) => {
            let images = registry
                .image_provider(name, ctx)
                .await
                .with_context(|| format!("Failed to start image provider '{}'", name))?;
            let integrated = images.integrate(pods.as_ref());
            tracing::info!(
                pod_provider = pods.name(),
                image_provider = images.name(),
                integrated,
                "Image integration"
            );
            Some(images)
        }
        None => None,
    };

    let server = CriServer::new(args.socket, pods, images);
    server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| anyhow::anyhow!("CRI server failed: {}", e))?;

    Ok(())
}
