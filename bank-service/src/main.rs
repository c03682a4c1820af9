use bank_service::config::BankConfig;
use bank_service::services::init_metrics;
use bank_service::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize metrics recorder (must be before any metrics are recorded)
    init_metrics();

    let config = BankConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
        config.log_json,
    );

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to start bank-service: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    application.run_until_stopped().await?;

    tracing::info!("bank-service stopped");
    Ok(())
}
