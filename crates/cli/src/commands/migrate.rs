use funnel_db::migrations;

use crate::commands::{with_database, CommandResult};

pub fn run() -> CommandResult {
    with_database("migrate", |_config, pool| async move {
        let pending = match migrations::pending_count(&pool).await {
            Ok(pending) => pending,
            Err(error) => {
                return CommandResult::failure("migrate", "db_connectivity", error.to_string(), 4);
            }
        };
        match migrations::run_pending(&pool).await {
            Ok(()) => {
                CommandResult::success("migrate", format!("applied {pending} pending migration(s)"))
            }
            Err(error) => CommandResult::failure("migrate", "migration", error.to_string(), 5),
        }
    })
}
