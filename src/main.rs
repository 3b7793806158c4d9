use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use txnscope_recorder::config::{Config, Environment};
use txnscope_recorder::logging;
use txnscope_recorder::node::NodeClient;
use txnscope_recorder::registry::{Registry, TopicKind};
use txnscope_recorder::shutdown::CancelScope;
use txnscope_recorder::supervisor::Supervisor;
use txnscope_recorder::worker::SubscriptionPolicy;

/// Record pending transactions from a node into hourly CSV logs
#[derive(Parser, Debug)]
#[command(name = "txnscope-recorder", version, about)]
struct Args {
    /// JSON config file; when given, the remaining flags are ignored
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "env", env = "ENV", value_enum, default_value = "local")]
    environment: Environment,

    /// Root directory of the output tree
    #[arg(long, env = "DATA_DIR", default_value = "tmp")]
    data_dir: PathBuf,

    /// IPC socket path or ws:// URL of the node
    #[arg(long, env = "L1_RPC_ENDPOINT", default_value = txnscope_recorder::node::DEFAULT_ENDPOINT)]
    rpc_endpoint: String,

    #[arg(long, env = "NUM_OF_RETRIES", default_value_t = 5)]
    num_of_retries: u32,

    #[arg(long, env = "L1_POLL_INTERVAL", default_value_t = 1000)]
    poll_interval_ms: u64,

    #[arg(long, value_enum, default_value = "pending-transactions")]
    topic: TopicKind,

    /// Label written to every source log line
    #[arg(long, default_value = txnscope_recorder::worker::DEFAULT_SOURCE)]
    source_label: String,

    #[arg(long, default_value_t = txnscope_recorder::worker::QUEUE_CAPACITY)]
    queue_capacity: usize,

    #[arg(long, value_enum, default_value = "halt")]
    subscription_policy: SubscriptionPolicy,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = self.config {
            return Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path.display()));
        }

        let config = Config {
            environment: self.environment,
            data_dir: self.data_dir,
            rpc_endpoint: self.rpc_endpoint,
            num_of_retries: self.num_of_retries,
            poll_interval_ms: self.poll_interval_ms,
            topic: self.topic,
            source_label: self.source_label,
            queue_capacity: self.queue_capacity,
            subscription_policy: self.subscription_policy,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    logging::init(config.environment).context("installing tracing subscriber")?;

    info!(
        config = %serde_json::to_string(&config)?,
        app_version = env!("CARGO_PKG_VERSION"),
        "Loaded config"
    );

    let node = NodeClient::connect(&config.node_config())
        .await
        .context("connecting to node")?;

    let mut supervisor = Supervisor::new(Registry::new(), Arc::new(node));
    supervisor
        .create_worker(&config)
        .context("creating worker")?;
    supervisor.start()?;

    tokio::select! {
        result = shutdown_signal(supervisor.scope()) => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
        _ = supervisor.await_cancellation() => {}
    }

    supervisor.shutdown().await;
    info!("Recorder stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then cancel `scope`
async fn shutdown_signal(scope: CancelScope) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal");
    scope.cancel();
    Ok(())
}
