use bazaar_agent::{AgentRuntime, RecommendMode};
use bazaar_core::domain::user::UserId;
use bazaar_db::RepositorySet;

use crate::commands::{run_with_store, CommandResult};

pub fn run(user_id: i64, mode: RecommendMode, limit: Option<usize>) -> CommandResult {
    let result = run_with_store("recommend", |config, pool| async move {
        let runtime = AgentRuntime::from_config(&config, RepositorySet::sql(pool))
            .map_err(|error| ("backend_config", error.to_string(), 6u8))?;
        runtime
            .recommend(UserId(user_id), mode, limit)
            .await
            .map_err(|error| ("agent", error.to_string(), 7u8))
    });

    match result {
        Ok(reply) => {
            let message = if reply.can_recommend {
                format!("{} candidates", reply.candidates.len())
            } else {
                "no candidates available".to_string()
            };
            CommandResult::with_data("recommend", message, serde_json::to_value(&reply).ok())
        }
        Err(failure) => failure,
    }
}
