/// Voltage Poller
///
/// Runs the polling server until Ctrl-C.
///
/// Usage: `poller [CONFIG]`; the config path falls back to `$POLLER_CONFIG`,
/// then to built-in defaults.

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use voltage_poller::config::SinkConfig;
use voltage_poller::{
    logging, ConsoleSink, DeviceRegistry, FileSink, JsonCatalogProvider, PollerConfig, PollerServer,
    SessionContext, TelemetrySink,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1).or_else(|| std::env::var("POLLER_CONFIG").ok()) {
        Some(path) => PollerConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => PollerConfig::default(),
    };
    logging::init(&config.logging);

    info!("🚀 {}", voltage_poller::info());

    let registry = DeviceRegistry::load(&config.registry.path)
        .await
        .context("loading device registry")?;
    let sink: Arc<dyn TelemetrySink> = match &config.sink {
        SinkConfig::Console => Arc::new(ConsoleSink),
        SinkConfig::File { path } => Arc::new(FileSink::new(path)),
    };
    let context = SessionContext {
        authenticator: Arc::new(registry),
        catalog: Arc::new(JsonCatalogProvider::new(&config.catalog.directory)),
        sink,
    };

    let mut server = PollerServer::new(config, context);
    server.start().await.context("starting server")?;

    let mut report = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = report.tick() => {
                let stats = server.get_stats().await;
                info!(
                    "📊 sessions: {} active, {} finished ({} failed), {} rejected",
                    stats.active_sessions,
                    stats.finished_sessions,
                    stats.failed_sessions,
                    stats.connections_rejected
                );
            }
        }
    }

    info!("🛑 Shutting down");
    server.stop();
    Ok(())
}
