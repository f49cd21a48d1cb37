use std::sync::Arc;

use funnel_core::{ClinicSlug, ForecastMode, ForecastSources, SystemClock, UpgradeForecastEngine};
use funnel_db::{
    SqlClinicDirectory, SqlContactStore, SqlConversionStore, SqlForecastStore, SqlSessionStore,
};

use crate::commands::{to_data, with_database, CommandResult};

pub fn run(slug: &str, mode: ForecastMode) -> CommandResult {
    let slug = ClinicSlug(slug.trim().to_string());

    with_database("forecast", |config, pool| async move {
        let engine = UpgradeForecastEngine::new(
            ForecastSources {
                clinics: Arc::new(SqlClinicDirectory::new(pool.clone())),
                contacts: Arc::new(SqlContactStore::new(pool.clone())),
                sessions: Arc::new(SqlSessionStore::new(pool.clone())),
                events: Arc::new(SqlConversionStore::new(pool.clone())),
                forecasts: Arc::new(SqlForecastStore::new(pool)),
            },
            Arc::new(SystemClock),
        )
        .with_settings(config.forecast.settings());

        let forecast = match engine.current_or_generate(&slug, mode).await {
            Ok(forecast) => forecast,
            Err(error) => return CommandResult::from_application_error("forecast", &error),
        };
        let message = format!(
            "{slug}: {} -> {} scored {} ({:?} confidence), expires {}",
            forecast.current_tier.as_str(),
            forecast.target_tier.as_str(),
            forecast.prediction_score,
            forecast.confidence,
            forecast.expires_at.format("%Y-%m-%d"),
        );

        match to_data("forecast", &forecast) {
            Ok(data) => CommandResult::success_with_data("forecast", message, Some(data)),
            Err(failure) => failure,
        }
    })
}
