//! Runcast CLI - Main Entry Point

use clap::{Parser, Subcommand};

use runcast_cli::commands::{run, scenario};
use runcast_cli::output::{print_error, print_success, print_value, OutputFormat};
use runcast_cli::ServerClient;

/// Runcast CLI - browser scenario runs
#[derive(Parser)]
#[command(name = "runcast")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server address
    #[arg(long, env = "RUNCAST_SERVER", default_value = "http://127.0.0.1:8080", global = true)]
    server: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage scenarios
    #[command(subcommand)]
    Scenario(scenario::ScenarioCommands),

    /// Submit, inspect and follow runs
    #[command(subcommand)]
    Run(run::RunCommands),

    /// Show server stream and queue counters
    Stats,

    /// Check server status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let client = ServerClient::new(&cli.server)?;
    tracing::debug!("Using server {}", client.base_url());

    match cli.command {
        Commands::Scenario(cmd) => scenario::execute(cmd, client, cli.format).await?,
        Commands::Run(cmd) => run::execute(cmd, client, cli.format).await?,
        Commands::Stats => {
            let stats = client.stats().await?;
            print_value(&stats, cli.format);
        }
        Commands::Status => match client.health().await {
            Ok(health) => print_success(&format!(
                "{} v{} is {} at {}",
                health.service,
                health.version,
                health.status,
                client.base_url()
            )),
            Err(e) => {
                print_error(&format!("Server is not responding at {}: {}", cli.server, e));
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("Runcast CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
