//! listmill - campaign engine entry point

use anyhow::Result;
use listmill_common::config::Config;
use listmill_core::{BounceManager, EngineConfig, Manager, Notifier, SmtpMessenger};
use listmill_storage::{DatabasePool, PgStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; its logging section shapes the subscriber.
    let config = Config::load()?;
    init_logging(&config);

    info!("Starting listmill...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;

    let store = Arc::new(PgStore::new(db_pool.clone(), config.bounce.action.clone()));

    // Campaign engine
    let engine_config = EngineConfig::from_config(&config.campaign, &config.server);
    let notifier = Notifier::new(&config.notifications);
    let manager = Arc::new(Manager::new(engine_config, store.clone(), notifier));

    // The SMTP messenger spans all configured servers; campaigns address
    // it by name.
    let messenger = SmtpMessenger::new(
        "email",
        config.smtp.clone(),
        config.server.hostname.clone(),
    )?;
    manager.add_messenger(Arc::new(messenger)).await?;

    manager.run().await;

    // Bounce pipeline
    let bounce_manager = Arc::new(BounceManager::new(config.bounce.clone(), store.clone()));
    bounce_manager.run().await;

    info!("listmill started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    bounce_manager.close().await;
    manager.close().await;

    info!("listmill shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},listmill=debug", config.logging.level)));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_level(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(filter)
            .init();
    }
}
