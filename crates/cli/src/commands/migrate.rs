use crate::commands::{run_with_store, CommandResult};

pub fn run() -> CommandResult {
    match run_with_store("migrate", |_, _| async { Ok(()) }) {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(failure) => failure,
    }
}
