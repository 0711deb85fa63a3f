pub mod commands;

use bazaar_agent::RecommendMode;
use bazaar_core::domain::item::ItemId;
use clap::{ArgGroup, Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "bazaar",
    about = "Bazaar marketplace agent CLI",
    long_about = "Prepare the marketplace store, inspect config, and talk to the persona agent.",
    after_help = "Examples:\n  bazaar migrate\n  bazaar seed\n  \
                  bazaar chat --user 2 --message \"おすすめは？\"\n  \
                  bazaar recommend --user 2 --keyword スニーカー"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic persona, user and item catalog")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Send one chat message as a user and print the persona's reply")]
    Chat {
        #[arg(long, help = "Acting user id")]
        user: i64,
        #[arg(long, help = "Message text")]
        message: String,
    },
    #[command(about = "Recommend items by seed item, keyword or the user's latest purchase")]
    #[command(group(
        ArgGroup::new("criterion").required(true).args(["seed_item", "keyword", "history"])
    ))]
    Recommend {
        #[arg(long, help = "Acting user id")]
        user: i64,
        #[arg(long, help = "Item id to find neighbours of")]
        seed_item: Option<i64>,
        #[arg(long, help = "Free-text keyword")]
        keyword: Option<String>,
        #[arg(long, help = "Use the user's most recent purchase as the seed")]
        history: bool,
        #[arg(long, help = "Maximum number of candidates")]
        limit: Option<usize>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Chat { user, message } => commands::chat::run(user, &message),
        Command::Recommend { user, seed_item, keyword, history, limit } => {
            match (seed_item, keyword, history) {
                (Some(seed), _, _) => {
                    commands::recommend::run(user, RecommendMode::SeedItem(ItemId(seed)), limit)
                }
                (None, Some(keyword), _) => {
                    commands::recommend::run(user, RecommendMode::Keyword(keyword), limit)
                }
                (None, None, true) => commands::recommend::run(user, RecommendMode::History, limit),
                (None, None, false) => commands::CommandResult::failure(
                    "recommend",
                    "usage",
                    "pass --seed-item, --keyword or --history",
                    2,
                ),
            }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
