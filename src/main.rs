//! toolguard - health monitor, circuit breaker and alert router for tool fleets

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use toolguard::{
    cli::{Cli, Command},
    config::Config,
    monitor::{Monitor, MonitorBuilder},
    persist::{BreakerStore, JsonFileStore},
    scheduler::Scheduler,
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig { ref file }) => check_config(file),
        Some(Command::Serve) | None => match run(&cli).await {
            Ok(()) => {
                info!("toolguard shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Validate a config file and print its tool table
fn check_config(file: &Path) -> ExitCode {
    let table = Config::load(Some(file)).and_then(|config| config.tool_table());
    match table {
        Ok(table) => {
            println!("✅ {} - valid, {} tool(s)", file.display(), table.len());
            for spec in table.specs() {
                let deps = if spec.dependencies.is_empty() {
                    String::new()
                } else {
                    format!(" -> {}", spec.dependencies.join(", "))
                };
                println!(
                    "  {} [tier {}, {:?}, sla {:?}]{}",
                    spec.id, spec.tier, spec.criticality, spec.sla_latency, deps
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {}: {e}", file.display());
            ExitCode::FAILURE
        }
    }
}

/// Run the monitor loop and dashboard until a shutdown signal arrives
async fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tools = config.tools.len(),
        dashboard = config.server.enabled,
        persistence = config.persistence.enabled,
        "Starting toolguard"
    );

    let store: Option<Arc<dyn BreakerStore>> = config
        .persistence
        .enabled
        .then(|| Arc::new(JsonFileStore::new(config.persistence.path.clone())) as Arc<dyn BreakerStore>);

    let monitor = Arc::new(
        MonitorBuilder::new(config.clone())
            .build()
            .context("Failed to build monitor")?,
    );

    if let Some(ref store) = store {
        let records = store.load().await.context("Failed to load breaker state")?;
        let restored = monitor.restore_breakers(&records);
        info!(restored, "Restored breaker state");
    }

    let delivery = monitor.alerts().start();

    let scheduler = Scheduler::new(Arc::new(toolguard::clock::SystemClock));
    monitor.schedule(&scheduler, store.clone());

    let (shutdown_tx, scheduler_rx) = broadcast::channel::<()>(1);

    let dashboard = config.server.enabled.then(|| {
        let monitor = Arc::clone(&monitor);
        let rx = shutdown_tx.subscribe();
        let server_config = config.server.clone();
        tokio::spawn(async move { server::serve(&server_config, monitor, rx).await })
    });

    tokio::spawn(server::shutdown_signal(shutdown_tx));
    scheduler.run(config.monitor.tick_interval, scheduler_rx).await;

    if let Some(handle) = dashboard {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Dashboard exited with error"),
            Err(e) => warn!(error = %e, "Dashboard task panicked"),
        }
    }

    if let Some(store) = store {
        save_breakers(&monitor, store.as_ref()).await?;
    }

    monitor
        .alerts()
        .shutdown(monitor.now(), delivery, config.alerting.shutdown_grace)
        .await;

    Ok(())
}

async fn save_breakers(monitor: &Monitor, store: &dyn BreakerStore) -> anyhow::Result<()> {
    let records = monitor.breaker_records();
    store
        .save(&records)
        .await
        .context("Failed to persist breaker state")?;
    info!(rows = records.len(), "Persisted breaker state");
    Ok(())
}
