use std::process::ExitCode;

fn main() -> ExitCode {
    bazaar_cli::run()
}
