//! Demo plugin: accepts every symbol, logs it and keeps the active set.
//! Stopping a symbol that is not running is refused.
//!
//! Logs go to stderr; the host forwards them into its own log.

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use portable_plugin::{Control, Meta, PluginRuntime, SymbolHandler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Mirror {
    active: DashMap<Meta, String>,
}

#[async_trait]
impl SymbolHandler for Mirror {
    async fn start_symbol(&self, ctrl: Control) -> anyhow::Result<()> {
        if ctrl.symbol_name.is_empty() {
            bail!("symbol name must not be empty");
        }
        info!(meta = %ctrl.meta, "start {} ({} running)", ctrl.symbol_name, self.active.len() + 1);
        self.active.insert(ctrl.meta, ctrl.symbol_name);
        Ok(())
    }

    async fn stop_symbol(&self, ctrl: Control) -> anyhow::Result<()> {
        match self.active.remove(&ctrl.meta) {
            Some((_, symbol)) => {
                info!(meta = %ctrl.meta, "stop {symbol}");
                Ok(())
            }
            None => bail!("symbol {} ({}) is not running", ctrl.symbol_name, ctrl.meta),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let runtime = PluginRuntime::new("mirror", Mirror::default());
    runtime.run_from_args().await?;
    Ok(())
}
