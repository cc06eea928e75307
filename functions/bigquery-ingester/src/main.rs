use bigquery_ingester::config::Settings;
use bigquery_ingester::server::{IngesterServer, ServerConfig};
use bigquery_ingester::IngestionService;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;
    let service = IngestionService::from_settings(&settings)?;

    IngesterServer::new(ServerConfig::from_settings(&settings), Arc::new(service))
        .run_until_shutdown()
        .await
}
