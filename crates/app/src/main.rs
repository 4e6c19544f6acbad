mod error;
mod maintenance;
mod router;
mod telemetry;
mod webhook;

use std::sync::Arc;

use tracing::info;

use shopfront_mercadopago::MercadoPagoClient;
use shopfront_storage::Database;
use shopfront_util::{load_env_file, AppConfig};

use maintenance::MaintenanceWorker;
use router::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;

    let http = reqwest::Client::builder().build()?;
    let mercadopago = MercadoPagoClient::new(
        config.mercadopago_access_token.clone(),
        config.mercadopago_api_base.clone(),
        http,
    );

    let secret: Arc<[u8]> = Arc::from(config.webhook_secret.as_bytes().to_vec().into_boxed_slice());
    let state = AppState::new(metrics, storage.clone(), secret, mercadopago);

    MaintenanceWorker::new(storage).spawn();

    info!(
        stage = "startup",
        addr = %config.bind_addr,
        env = config.environment.as_str(),
        "webhook processor listening"
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app_router(state)).await?;

    Ok(())
}
