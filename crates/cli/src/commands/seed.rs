use bazaar_db::{MarketplaceSeedDataset, RepositorySet, SeedResult};
use serde_json::json;

use crate::commands::{run_with_store, CommandResult};

pub fn run() -> CommandResult {
    let result = run_with_store("seed", |_, pool| async move {
        let repos = RepositorySet::sql(pool);
        let seeded = MarketplaceSeedDataset::load(&repos)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;

        let verification = MarketplaceSeedDataset::verify(&repos)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 7u8))?;
        if !verification.all_present {
            let failed: Vec<&str> = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
                .collect();
            return Err(("seed_verification", verification_message(&failed), 7u8));
        }
        Ok(seeded)
    });

    match result {
        Ok(seeded) => {
            let counts = json!({
                "personas": seeded.personas_seeded,
                "users": seeded.users_seeded,
                "items": seeded.items_seeded,
            });
            CommandResult::with_data("seed", summary(&seeded), Some(counts))
        }
        Err(failure) => failure,
    }
}

fn summary(seeded: &SeedResult) -> String {
    format!(
        "marketplace seed loaded: {} personas, {} users, {} items",
        seeded.personas_seeded, seeded.users_seeded, seeded.items_seeded
    )
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
