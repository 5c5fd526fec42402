//! Standalone event stream: `anvil serve`.
//!
//! Workflows run by other `anvil` processes write only to the shared log, so
//! the server tails the log into its own bus instead of sharing an engine.

use anyhow::Result;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use anvil::config::AnvilConfig;
use anvil::events::{EventBus, EventLog, LogTailer, SqliteEventLog};
use anvil::server::{self, AppState};

const TAIL_INTERVAL: Duration = Duration::from_millis(200);

pub async fn cmd_serve(config: AnvilConfig, port: Option<u16>) -> Result<ExitCode> {
    config.ensure_dirs()?;
    let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::open(&config.db_path())?);
    let bus = EventBus::new(config.toml.bus.capacity);
    let shutdown = CancellationToken::new();

    let pump = tokio::spawn(
        LogTailer::new(log.clone(), TAIL_INTERVAL).pump(bus.clone(), shutdown.clone()),
    );
    {
        let shutdown = shutdown.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down event stream");
                shutdown.cancel();
                // Ends open sockets so graceful shutdown can finish.
                bus.shutdown();
            }
        });
    }

    let port = port.unwrap_or(config.toml.server.port);
    let result = server::serve(
        &config.toml.server.host,
        port,
        AppState {
            log,
            bus: bus.clone(),
        },
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    bus.shutdown();
    let _ = pump.await;
    result?;
    Ok(ExitCode::SUCCESS)
}
