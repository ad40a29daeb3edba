use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Honors `RUST_LOG` when set, otherwise falls back to the configured level.
pub fn init() -> anyhow::Result<()> {
    let level = crate::conf::global().log_level;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow!("Failed to init tracing: {error:?}"))
}
