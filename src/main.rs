mod api;
mod automation;
mod config;
mod handler;
mod helpers;
mod keys;
mod mqtt;
mod regs;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use api::AppState;
use automation::AutomationEngine;
use config::BridgeConfig;
use regs::RegisterTable;
use services::ServiceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,thermiq_bridge=debug")),
        )
        .init();

    tracing::info!("Starting thermiq-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("THERMIQ_CONFIG").unwrap_or_else(|_| "thermiq.yaml".to_string());
    let config = BridgeConfig::load(std::path::Path::new(&config_path))?;
    tracing::info!(
        node = %config.mqtt_node,
        debug_topics = config.thermiq_dbg,
        "Bridging heat pump at {}:{}",
        config.broker_host,
        config.broker_port
    );

    let app = Arc::new(AppState::new(config.topics()));
    let table = Arc::new(RegisterTable::new());

    let (publish_tx, publish_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(ServiceRegistry::new(
        app.clone(),
        table.clone(),
        publish_tx,
    ));

    // Seed every register entity and helper before any traffic arrives
    let numeric_helpers = helpers::create_entities(&app, &table);
    tracing::info!(
        entities = app.state_machine.len(),
        "Entities and helpers created"
    );

    let engine = Arc::new(AutomationEngine::new(
        app.clone(),
        registry.clone(),
        numeric_helpers,
    ));
    tokio::spawn(engine.clone().run());

    let (_publisher, _subscriber) =
        mqtt::start_mqtt(&config, app.clone(), table.clone(), registry.clone(), publish_rx);

    let router = api::router(app.clone(), registry.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
