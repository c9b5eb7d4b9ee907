mod cli;

use std::process::ExitCode;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    Cli::run_from_args().await
}
