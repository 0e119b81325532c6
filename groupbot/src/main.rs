use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use groupbot::{built_info, chat, config::BotConfig, schedule, server};
use schemars::schema_for;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file, environment variables override it
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot, the default
    Run,
    /// Validate the configuration without connecting anywhere
    Check,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Output JSON schema of config
    Schema,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("groupbot=info,teloxide=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config {
            command: ConfigCommands::Schema,
        } => {
            let schema = schema_for!(BotConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => check(&cli.config),
        Commands::Run => run(&cli.config).await,
    }
}

fn check(path: &Path) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!(
        "groupbot {} ({}, {})",
        built_info::PKG_VERSION,
        built_info::TARGET,
        built_info::RUSTC_VERSION
    );
    let config = BotConfig::load(path)?;
    let problems = config.validate();
    if problems.is_empty() {
        println!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }
    for problem in problems {
        eprintln!("- {problem}");
    }
    Ok(ExitCode::FAILURE)
}

async fn run(path: &Path) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = BotConfig::load(path)?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in problems {
            error!("Invalid configuration: {problem}");
        }
        return Ok(ExitCode::FAILURE);
    }

    info!("Starting groupbot {}", built_info::PKG_VERSION);
    let addr = config.listen_addr()?;
    let domain = config.telegram.webhook_domain.clone();

    let service = config.build().await?;
    service.seed().await?;
    let mut scheduler = schedule::start(&service).await?;
    let dispatcher = chat::dispatcher(&service);

    let served = match domain {
        Some(domain) => server::serve_webhook(&service, dispatcher, addr, &domain).await,
        None => server::serve_polling(&service, dispatcher, addr).await,
    };

    info!("Shutting down");
    if let Err(err) = scheduler.shutdown().await {
        warn!("Failed to stop the scheduler: {err}");
    }
    service.shutdown();
    served?;
    Ok(ExitCode::SUCCESS)
}
