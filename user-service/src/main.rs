use std::sync::Arc;

use anyhow::{Context, Result};
use relaymesh::{ConnectionManager, Worker};
use tracing::{error, info};

use user_service::consumers::serve_lookups;
use user_service::settings::Settings;
use user_service::store::{Database, UserStore};
use user_service::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("loading configuration")?;
    telemetry::init(&settings.log)?;
    let name = settings.service.name.clone();
    info!(service = %name, "Starting user service");

    let database = Database::connect(&settings.database)
        .await
        .context("connecting to MongoDB")?;
    let store: Arc<dyn UserStore> = Arc::new(database.users());

    let connection = Arc::new(ConnectionManager::with_config(
        settings.rabbitmq.connection_config(&name),
    ));
    connection.connect().await.context("connecting to RabbitMQ")?;

    let worker = Arc::new(Worker::new(
        connection.clone(),
        settings.worker.worker_config(&name),
    ));
    let mut serving = tokio::spawn({
        let worker = worker.clone();
        async move { serve_lookups(&worker, store).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            worker.stop();
            match serving.await {
                Ok(result) => result?,
                Err(e) => error!(error = %e, "Lookup worker task failed"),
            }
        }
        finished = &mut serving => {
            // Serving only ends on its own when the broker stays unreachable
            finished.context("lookup worker task failed")??;
        }
    }

    info!(stats = ?connection.stats(), "User service stopped");
    Ok(())
}
