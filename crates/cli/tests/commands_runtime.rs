use std::env;
use std::sync::{Mutex, OnceLock};

use bazaar_agent::RecommendMode;
use bazaar_cli::commands::{chat, migrate, recommend, seed};
use serde_json::Value;

const MEMORY_STORE: &[(&str, &str)] = &[
    ("BAZAAR_DATABASE_URL", "sqlite::memory:"),
    ("BAZAAR_DATABASE_MAX_CONNECTIONS", "1"),
    ("BAZAAR_LLM_PROVIDER", "disabled"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(MEMORY_STORE, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("BAZAAR_DATABASE_URL", "postgres://localhost/bazaar")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_reports_catalog_counts() {
    with_env(MEMORY_STORE, || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"]["personas"], 3);
        assert_eq!(payload["data"]["users"], 3);
        assert!(payload["data"]["items"].as_u64().unwrap_or_default() > 0);
    });
}

#[test]
fn chat_with_disabled_backend_answers_with_fallback_line() {
    with_env(MEMORY_STORE, || {
        let result = chat::run(7, "こんにちは");
        assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "chat");
        assert_eq!(payload["data"]["termination"]["state"], "backend_failed");
        assert_eq!(payload["message"], payload["data"]["reply"]);
    });
}

#[test]
fn chat_rejects_blank_message() {
    with_env(MEMORY_STORE, || {
        let result = chat::run(7, "   ");
        assert_eq!(result.exit_code, 7);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "agent");
    });
}

#[test]
fn recommend_on_empty_catalog_reports_no_candidates() {
    with_env(MEMORY_STORE, || {
        let result = recommend::run(1, RecommendMode::Keyword("sneakers".to_string()), None);
        assert_eq!(result.exit_code, 0, "expected recommend success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["can_recommend"], false);
        assert_eq!(payload["message"], "no candidates available");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "BAZAAR_DATABASE_URL",
        "BAZAAR_DATABASE_MAX_CONNECTIONS",
        "BAZAAR_DATABASE_TIMEOUT_SECS",
        "BAZAAR_LLM_PROVIDER",
        "BAZAAR_LLM_API_KEY",
        "BAZAAR_LLM_BASE_URL",
        "BAZAAR_LLM_MODEL",
        "BAZAAR_LLM_TIMEOUT_SECS",
        "BAZAAR_AGENT_MAX_TOOL_ITERATIONS",
        "BAZAAR_AGENT_HISTORY_WINDOW",
        "BAZAAR_RECOMMEND_TOP_K",
        "BAZAAR_GACHA_COST",
        "BAZAAR_SERVER_BIND_ADDRESS",
        "BAZAAR_SERVER_PORT",
        "BAZAAR_LOGGING_LEVEL",
        "BAZAAR_LOGGING_FORMAT",
        "BAZAAR_LOG_LEVEL",
        "BAZAAR_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
