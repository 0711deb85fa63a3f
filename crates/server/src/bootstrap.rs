use std::sync::Arc;

use bazaar_agent::{AgentError, AgentRuntime};
use bazaar_core::config::{AppConfig, ConfigError};
use bazaar_db::{connect_with_settings, migrations, DbPool, RepositorySet};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("agent runtime failed to start: {0}")]
    Agent(#[from] AgentError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let runtime = AgentRuntime::from_config(&config, RepositorySet::sql(db_pool.clone()))?;

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}

#[cfg(test)]
mod tests {
    use bazaar_core::config::{AppConfig, ConfigOverrides, LlmProvider, LoadOptions};

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    fn overrides(provider: LlmProvider) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                llm_provider: Some(provider),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_api_key_for_openai() {
        let result = bootstrap(overrides(LlmProvider::OpenAi)).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("llm.api_key"), "unexpected message: {message}");
    }

    #[tokio::test]
    async fn bootstrap_creates_marketplace_tables_with_disabled_backend() {
        let app = bootstrap(overrides(LlmProvider::Disabled))
            .await
            .expect("bootstrap should succeed with the backend disabled");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('users', 'agent_personas', 'items', 'chat_messages')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected marketplace tables after bootstrap");
        assert_eq!(table_count, 4);
    }
}
