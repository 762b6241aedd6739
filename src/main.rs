// ABOUTME: Binary entry point for the toolkit CLI
// ABOUTME: Installs logging, parses arguments and reports failures with their cause chain

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use b2c_toolkit::cli::{self, Cli};
use b2c_toolkit::error::toolkit_error;
use b2c_toolkit::features::FeatureRegistry;
use b2c_toolkit::ToolkitError;

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = cli::run(cli, &FeatureRegistry::new()).await {
        tracing::error!("{:#}", e);
        let code = match toolkit_error(&e) {
            Some(ToolkitError::Config(_)) | Some(ToolkitError::Validation(_)) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
