use std::sync::Arc;

use grpc_discovery::config::Config;
use grpc_discovery::services::discovery::{ServiceManager, new_registry};
use grpc_discovery::telemetry::init_tracing;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    init_tracing(&config.logging);

    // 日志就绪后再报告配置来源
    match &config.source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config file"),
        None => tracing::info!(path = %config_path, "Config file not found, using defaults"),
    }

    tracing::info!(
        config_path = %config_path,
        discovery_type = %config.discovery.kind,
        services = config.services.len(),
        "Starting service registration"
    );

    let registry = new_registry(&config.discovery).await?;
    let manager = Arc::new(ServiceManager::new(registry));

    for record in config.services.iter().cloned() {
        let name = record.name.clone();
        if let Err(e) = manager.register_service(record).await {
            tracing::error!(service_name = %name, error = %e, "Failed to register service");
        }
    }

    tracing::info!(registered = manager.len().await, "Services registered, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received, deregistering services");
    manager.deregister_all().await?;
    manager.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
