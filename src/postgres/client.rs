use std::time::Duration;

use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::Result;

/// Opens a connection and spawns its driver task.
///
/// The returned [`Client`] is usable until the driver task observes a fatal
/// connection error, after which every query fails; callers treat that as a
/// fatal condition and let the process restart.
pub async fn connect(cfg: &DatabaseConfig) -> Result<Client> {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&cfg.host)
        .port(cfg.port)
        .dbname(&cfg.database)
        .user(&cfg.username)
        .password(&cfg.password)
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs));

    let (client, connection) = pg_config.connect(NoTls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });

    info!(
        host = %cfg.host,
        database = %cfg.database,
        "Connected to PostgreSQL"
    );

    Ok(client)
}
