use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crowdsec_cloudflare_worker_bouncer::config::{
    self, BouncerConfig, DEFAULT_CONFIG_PATH, PRODUCT_NAME,
};
use crowdsec_cloudflare_worker_bouncer::orchestrator::{self, RunMode};

#[derive(Parser)]
#[command(name = PRODUCT_NAME, version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Comma separated tokens to generate config for
    #[arg(short = 'g', value_name = "TOKENS")]
    generate_tokens: Option<String>,

    /// Path to store generated config to
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Test config and exit
    #[arg(short = 't')]
    test_config: bool,

    /// Show full config (.yaml + .yaml.local) and exit
    #[arg(short = 'T')]
    show_config: bool,

    /// Delete all the created infra and exit
    #[arg(short = 'd')]
    delete_only: bool,

    /// Setup the infra and exit
    #[arg(short = 's')]
    setup_only: bool,

    /// Setup the infra in autonomous mode (decisions synced by the worker) and exit
    #[arg(short = 'S')]
    setup_autonomous: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "exiting");
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if let Some(tokens) = &cli.generate_tokens {
        let rendered = config::generate_from_tokens(tokens, &config_path).await?;
        match &cli.output {
            Some(path) => {
                std::fs::write(path, rendered)?;
                println!("Config successfully generated in {}", path.display());
            }
            None => print!("{rendered}"),
        }
        return Ok(());
    }

    let config = BouncerConfig::from_path(&config_path)?;
    // The guard keeps the file writer alive for the whole run.
    let _log_guard = config::setup_logging(&config.logging)?;

    if cli.test_config {
        info!("config is valid");
        println!("config is valid");
        return Ok(());
    }
    if cli.show_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let mode = if cli.delete_only {
        RunMode::DeleteOnly
    } else if cli.setup_autonomous {
        RunMode::SetupAutonomous
    } else if cli.setup_only {
        RunMode::SetupOnly
    } else {
        RunMode::Daemon
    };
    orchestrator::run(config, mode).await
}
