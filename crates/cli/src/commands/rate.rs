use std::sync::Arc;

use funnel_core::{ClinicSlug, ConversionRateCalculator, SystemClock};
use funnel_db::{SqlClinicDirectory, SqlConversionStore};

use crate::commands::{to_data, with_database, CommandResult};

pub const DEFAULT_DAYS: u32 = 30;

pub fn run(slug: &str, days: u32) -> CommandResult {
    let slug = ClinicSlug(slug.trim().to_string());

    with_database("rate", |_config, pool| async move {
        let calculator = ConversionRateCalculator::new(
            Arc::new(SqlClinicDirectory::new(pool.clone())),
            Arc::new(SqlConversionStore::new(pool)),
            Arc::new(SystemClock),
        );

        let rate = match calculator.trailing(&slug, days).await {
            Ok(rate) => rate,
            Err(error) => return CommandResult::from_application_error("rate", &error),
        };
        let message = format!(
            "{slug}: {} conversion(s), {:.2}% over the last {days} day(s)",
            rate.total_conversions, rate.conversion_rate
        );

        match to_data("rate", &rate) {
            Ok(data) => CommandResult::success_with_data("rate", message, Some(data)),
            Err(failure) => failure,
        }
    })
}
