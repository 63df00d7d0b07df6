use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bucketconf::NodeConfig;
use bucketry::{Bucket, BucketConfig, Executor, Group, TaskError};
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The bucketry node daemon
///
/// Serves the configured task buckets and joins the peer mesh.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/bucketry/config.toml
/// 3. ~/.config/bucketry/config.toml
/// 4. ./bucketry.toml (or --config path)
/// 5. Environment variables (BUCKETRY_*)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./bucketry.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fill one demo task per bucket after startup
    #[arg(long)]
    seed: bool,
}

/// Executor that only narrates the task lifecycle. Real deployments embed
/// the library and supply their own.
struct LogExecutor;

#[async_trait]
impl Executor for LogExecutor {
    async fn on_execute(&self, id: &str, payload: &Value) -> Result<()> {
        info!(task.id = %id, payload = %payload, "executing");
        Ok(())
    }

    async fn on_finish(&self, id: &str, _payload: &Value) -> Result<()> {
        info!(task.id = %id, "finished");
        Ok(())
    }

    async fn on_task_exhausted(&self, id: &str, _payload: &Value) -> Result<()> {
        warn!(task.id = %id, "exhausted");
        Ok(())
    }

    async fn on_execute_error(
        &self,
        id: &str,
        _payload: &Value,
        execute_err: &TaskError,
    ) -> Result<()> {
        error!(task.id = %id, error = %execute_err, "execute failed");
        Ok(())
    }

    async fn on_panic(&self, id: &str, _payload: &Value) -> Result<()> {
        error!(task.id = %id, "panicked");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        NodeConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.node.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        port = %config.node.server_port,
        peers = config.node.peers.len(),
        buckets = config.buckets.len(),
        "starting bucketry node"
    );

    let executor: Arc<dyn Executor> = Arc::new(LogExecutor);
    let mut buckets = HashMap::new();
    for (name, settings) in &config.buckets {
        buckets.insert(
            name.clone(),
            Bucket::new(name.clone(), BucketConfig::from(settings), executor.clone()),
        );
    }

    let group = Group::new(
        buckets,
        config.node.peers.clone(),
        config.node.server_port.clone(),
        config.node.debug,
    );

    if cli.seed {
        for name in config.buckets.keys() {
            let pid = uuid::Uuid::new_v4().to_string();
            match group.fill(name, &pid, serde_json::json!({ "seed": true })) {
                Ok(()) => info!(bucket = %name, task.id = %pid, "seeded"),
                Err(e) => warn!(bucket = %name, error = %e, "seed fill failed"),
            }
        }
    }

    tokio::select! {
        result = group.start_work() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            group.stop_work();
        }
    }

    Ok(())
}
