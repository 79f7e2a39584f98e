use axum::Router;
use clap::Parser;
use scriptmock::{EngineSettings, Registry, admin, load_nodes, metrics};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "scriptmock")]
#[command(about = "Scripted mock HTTP endpoints with condition-gated response variants")]
struct Cli {
    /// Address the control API listens on.
    #[arg(long, env = "SCRIPTMOCK_ADMIN_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    admin_host: IpAddr,

    /// Port of the control API.
    #[arg(long, env = "SCRIPTMOCK_PORT", default_value_t = 3900)]
    port: u16,

    /// JSON or YAML node file; enabled nodes are started at boot.
    #[arg(long, env = "SCRIPTMOCK_NODES", default_value = "nodes.json")]
    nodes: PathBuf,

    /// Address mock instances bind to.
    #[arg(long, env = "SCRIPTMOCK_BIND_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind_host: IpAddr,

    /// Budget for a single condition script, in milliseconds.
    #[arg(long, env = "SCRIPTMOCK_SCRIPT_TIMEOUT_MS", default_value_t = 300)]
    script_timeout_ms: u64,

    /// Condition scripts allowed to run at once.
    #[arg(long, env = "SCRIPTMOCK_MAX_CONCURRENT_SCRIPTS", default_value_t = 32)]
    max_concurrent_scripts: usize,

    /// How long stopping a mock waits for in-flight requests, in milliseconds.
    #[arg(long, env = "SCRIPTMOCK_DRAIN_TIMEOUT_MS", default_value_t = 5000)]
    drain_timeout_ms: u64,
}

impl Cli {
    fn settings(&self) -> EngineSettings {
        EngineSettings {
            bind_host: self.bind_host,
            script_timeout: Duration::from_millis(self.script_timeout_ms),
            max_concurrent_scripts: self.max_concurrent_scripts,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            ..EngineSettings::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    metrics::register_process_metrics();

    let registry = Registry::new(cli.settings());
    for node in load_nodes(&cli.nodes)? {
        if let Err(e) = registry.configure(&node.node_id, node.config) {
            tracing::error!("Skipping node {}: {}", node.node_id, e);
            continue;
        }
        if node.enabled
            && let Err(e) = registry.start(&node.node_id).await
        {
            tracing::error!("Failed to start node {}: {}", node.node_id, e);
        }
    }

    let app = Router::new().nest("/_admin", admin::router(registry.clone()));

    let listener = tokio::net::TcpListener::bind((cli.admin_host, cli.port)).await?;
    tracing::info!("Control API running on http://{}:{}", cli.admin_host, cli.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.stop_all().await;
    Ok(())
}
