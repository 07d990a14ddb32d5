mod cli;
mod commands;
mod config;

use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands, LogFormat};
use crate::commands::{CommandExecutor, SendArgs};
use crate::config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "notify_dispatch=info,notify_cli=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.log_format, args.verbose);

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = AppConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config.display());

    let executor = CommandExecutor::new(config.build_dispatcher()?, config.module_settings);

    match args.command {
        Commands::Send {
            channel,
            title,
            message,
            url,
            attributes,
            bot_name,
            file,
        } => {
            let token = CancellationToken::new();
            let ctrl_c_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, cancelling dispatch");
                    ctrl_c_token.cancel();
                }
            });

            let send_args = SendArgs {
                channel,
                title,
                message,
                url,
                attributes,
                bot_name,
                file,
            };
            executor.send(send_args, &token).await?;
        }
        Commands::TestConnection => executor.test_connection().await?,
        Commands::Channels { json } => executor.list_channels(json).await?,
        Commands::Schema => executor.print_schema()?,
    }

    Ok(())
}

fn init_logging(format: LogFormat, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("notify_dispatch=debug,notify_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}
