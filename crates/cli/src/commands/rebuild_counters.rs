use std::sync::Arc;

use funnel_core::{ClinicSlug, CounterRebuilder};
use funnel_db::{SqlClinicDirectory, SqlConversionStore};

use crate::commands::{to_data, with_database, CommandResult};

pub fn run(slug: &str) -> CommandResult {
    let slug = ClinicSlug(slug.trim().to_string());

    with_database("rebuild-counters", |_config, pool| async move {
        let store = Arc::new(SqlConversionStore::new(pool.clone()));
        let rebuilder =
            CounterRebuilder::new(Arc::new(SqlClinicDirectory::new(pool)), store.clone(), store);

        let counters = match rebuilder.rebuild(&slug).await {
            Ok(counters) => counters,
            Err(error) => {
                return CommandResult::from_application_error("rebuild-counters", &error);
            }
        };
        let message = format!(
            "{slug}: rebuilt counters from {} event(s), total value {}",
            counters.total, counters.total_value
        );

        match to_data("rebuild-counters", &counters) {
            Ok(data) => CommandResult::success_with_data("rebuild-counters", message, Some(data)),
            Err(failure) => failure,
        }
    })
}
