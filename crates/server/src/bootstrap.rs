use std::sync::Arc;

use axum::Router;
use funnel_core::config::{AppConfig, ConfigError, LoadOptions};
use funnel_core::experiments::ThreadRandom;
use funnel_core::SystemClock;
use funnel_db::{
    connect_with_config, migrations, DbPool, SqlAssignmentStore, SqlClinicDirectory,
    SqlContactStore, SqlConversionStore, SqlForecastStore, SqlSessionStore, SqlVariantTestStore,
};
use thiserror::Error;
use tracing::info;

use crate::api::{self, AppState, Ports};
use crate::health;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

impl Application {
    /// API routes plus `/health`, all carrying correlation ids.
    pub fn router(&self) -> Router {
        api::router(self.state.clone()).merge(health::router(self.db_pool.clone()))
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let conversions = Arc::new(SqlConversionStore::new(db_pool.clone()));
    let ports = Ports {
        clinics: Arc::new(SqlClinicDirectory::new(db_pool.clone())),
        contacts: Arc::new(SqlContactStore::new(db_pool.clone())),
        sessions: Arc::new(SqlSessionStore::new(db_pool.clone())),
        tests: Arc::new(SqlVariantTestStore::new(db_pool.clone())),
        assignments: Arc::new(SqlAssignmentStore::new(db_pool.clone())),
        events: conversions.clone(),
        counters: conversions,
        forecasts: Arc::new(SqlForecastStore::new(db_pool.clone())),
    };
    let state = AppState::new(ports, &config, Arc::new(SystemClock), Arc::new(ThreadRandom));

    Ok(Application { config, db_pool, state })
}
