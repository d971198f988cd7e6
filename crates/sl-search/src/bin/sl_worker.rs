use std::sync::Arc;

use anyhow::Context;
use sl_search::{CommandTrial, SearchLoop, WorkerConfig};
use sl_store::{BufferedPublisher, LocalBlobStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        rank = config.rank,
        store = %config.store_root.display(),
        scratch = %config.scratch_dir.display(),
        "starting worker"
    );

    let store = LocalBlobStore::new(&config.store_root)
        .with_context(|| format!("opening store at {}", config.store_root.display()))?;
    let publisher = Arc::new(BufferedPublisher::new(&config.scratch_dir, Arc::new(store))?);
    let executor = CommandTrial::from_command_line(&config.trial_command)?;

    let mut search = SearchLoop::new(config.rank, publisher, executor);
    if let Some(seed) = config.seed {
        search = search.with_seed(seed);
    }

    let summary = search.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
