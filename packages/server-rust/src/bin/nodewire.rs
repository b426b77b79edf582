use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodewire_server::network::{ConnectOptions, Transport};
use nodewire_server::node::builtin::register_builtin;
use nodewire_server::{ExecutorConfig, NodeRegistry, NodeServer, ServerConfig};

/// nodewire - runtime-created nodes behind a pub/sub command channel
#[derive(Parser)]
#[command(name = "nodewire", version, about)]
struct Cli {
    /// Broker host
    #[arg(long, env = "NODEWIRE_HOST", default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(long, env = "NODEWIRE_PORT", default_value = "1883")]
    port: u16,

    /// Broker username (sent only together with a password)
    #[arg(long, env = "NODEWIRE_USERNAME")]
    username: Option<String>,

    /// Broker password
    #[arg(long, env = "NODEWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Client id; also namespaces the device topics
    #[arg(long, env = "NODEWIRE_CLIENT_ID", default_value = "recamera")]
    client_id: String,

    /// Topic root shared by devices of the same protocol version
    #[arg(long, env = "NODEWIRE_TOPIC_ROOT", default_value = "sscma/v0")]
    topic_root: String,

    /// Executor worker count
    #[arg(long, env = "NODEWIRE_WORKERS", default_value = "4")]
    workers: usize,

    /// Delay before a not-ready command is retried
    #[arg(long, env = "NODEWIRE_RETRY_DELAY_MS", default_value = "10")]
    retry_delay_ms: u64,

    /// Give up on a command after this many retries (default: never)
    #[arg(long, env = "NODEWIRE_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Deadline for node commands (default: none)
    #[arg(long, env = "NODEWIRE_COMMAND_TIMEOUT_MS")]
    command_timeout_ms: Option<u64>,

    /// Do not publish the `node` announcement after connecting
    #[arg(long)]
    no_announce: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "NODEWIRE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "NODEWIRE_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            topic_root: self.topic_root.clone(),
            client_id: self.client_id.clone(),
            announce: !self.no_announce,
            executor: ExecutorConfig {
                workers: self.workers,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
                max_retries: self.max_retries,
                ..ExecutorConfig::default()
            },
            command_timeout: self.command_timeout_ms.map(Duration::from_millis),
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ..ConnectOptions::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "mqtt")]
fn transport() -> Arc<dyn Transport> {
    Arc::new(nodewire_server::network::MqttTransport::new())
}

#[cfg(not(feature = "mqtt"))]
fn transport() -> Arc<dyn Transport> {
    warn!("built without the `mqtt` feature, using the in-process transport");
    Arc::new(nodewire_server::LoopbackTransport::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let registry = Arc::new(NodeRegistry::new());
    register_builtin(&registry);
    info!(kinds = ?registry.kinds(), "node types registered");

    let mut server = NodeServer::new(cli.server_config(), registry);
    server
        .start(transport(), &cli.connect_options())
        .await
        .with_context(|| format!("failed to connect to {}:{}", cli.host, cli.port))?;

    server.run(shutdown_signal()).await?;
    Ok(())
}
