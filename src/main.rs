use std::sync::Arc;

use jedi_core::config::DaemonConfig;
use jedi_core::ddm::{DataCatalog, DryRunCatalog};
use jedi_core::store::{LibSqlTaskStore, TaskStore};
use jedi_core::topology::{SiteMapper, StaticTopology};
use jedi_core::watchdog::{self, WatchDog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DaemonConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    eprintln!("JEDI watchdog v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   VO: {}", config.vo);
    eprintln!("   Labels: {}", config.prod_source_labels.join(", "));
    eprintln!("   Interval: {}s", config.interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlTaskStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Topology ─────────────────────────────────────────────────────────
    let topology: Arc<dyn SiteMapper> = Arc::new(
        StaticTopology::load(&config.topology_path).unwrap_or_else(|e| {
            eprintln!(
                "Error: Failed to load topology from {}: {}",
                config.topology_path.display(),
                e
            );
            std::process::exit(1);
        }),
    );

    // Subscriptions and metadata are logged only.
    let catalog: Arc<dyn DataCatalog> = Arc::new(DryRunCatalog::new());

    // ── Watchdogs ────────────────────────────────────────────────────────
    let mut handles = Vec::new();
    for label in &config.prod_source_labels {
        let dog = Arc::new(WatchDog::new(
            config.watchdog.clone(),
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&topology),
            config.vo.clone(),
            label.clone(),
        ));
        handles.push(watchdog::spawn_watchdog_ticker(dog, config.interval));
        tracing::info!(vo = %config.vo, prod_source_label = %label, "Watchdog started");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
