use std::path::PathBuf;

mod check_cmd;
mod checker_cmd;

#[derive(Debug, clap::Parser)]
#[command(name = "stratad", version)]
struct Args {
    /// Path to the checker configuration file. Defaults apply when absent.
    #[arg(long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// Run the object-store integrity checker daemon
    Checker,
    /// Run a one-shot check of a single instance, without taking a job lease
    Check {
        /// The instance to check.
        #[arg(long, env = "STRATA_INSTANCE_ID")]
        instance_id: String,
        /// Also run the inverted (storage -> metadata) check.
        #[arg(long)]
        inverted: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = main_inner().await {
        // Manually print the error so we can control the format.
        let err = error_with_causes(&err);
        eprintln!("Exiting with error: {err}");
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    monitoring::logging::init();

    let Args { config, command } = clap::Parser::parse();
    let config = strata_config::load(config.as_deref()).map_err(Error::LoadConfig)?;

    match command {
        Command::Checker => checker_cmd::run(config).await.map_err(Error::Checker),
        Command::Check {
            instance_id,
            inverted,
        } => check_cmd::run(config, instance_id, inverted)
            .await
            .map_err(Error::Check),
    }
}

/// Top-level error type for the `stratad` binary.
///
/// Each variant wraps a command-specific error, providing a unified error
/// type for the main entry point while preserving the full error chain.
#[derive(Debug, thiserror::Error)]
enum Error {
    /// Failed to load configuration.
    #[error("Failed to load config: {0}")]
    LoadConfig(#[source] strata_config::LoadConfigError),

    /// Checker daemon failed.
    #[error("Checker command failed: {0}")]
    Checker(#[source] checker_cmd::Error),

    /// One-shot check failed.
    #[error("Check command failed: {0}")]
    Check(#[source] check_cmd::Error),
}

/// Builds an error chain string from an error and its sources.
fn error_with_causes(err: &dyn std::error::Error) -> String {
    let mut error_chain = Vec::new();
    let mut current = err;
    while let Some(source) = current.source() {
        error_chain.push(source.to_string());
        current = source;
    }

    if error_chain.is_empty() {
        err.to_string()
    } else {
        format!("{} | Caused by: {}", err, error_chain.join(" -> "))
    }
}
