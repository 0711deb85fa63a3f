use bazaar_agent::AgentRuntime;
use bazaar_core::domain::user::UserId;
use bazaar_db::RepositorySet;

use crate::commands::{run_with_store, CommandResult};

/// One exchange against the configured store and text backend.
pub fn run(user_id: i64, message: &str) -> CommandResult {
    let result = run_with_store("chat", |config, pool| async move {
        let runtime = AgentRuntime::from_config(&config, RepositorySet::sql(pool))
            .map_err(|error| ("backend_config", error.to_string(), 6u8))?;
        runtime
            .converse(UserId(user_id), message, None)
            .await
            .map_err(|error| ("agent", error.to_string(), 7u8))
    });

    match result {
        Ok(reply) => {
            let data = serde_json::to_value(&reply).ok();
            CommandResult::with_data("chat", reply.reply, data)
        }
        Err(failure) => failure,
    }
}
