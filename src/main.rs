use clap::Parser;
use tracing_subscriber::EnvFilter;

use stage_control::app::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging (set RUST_LOG=debug to see every command on the wire)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = app::run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
