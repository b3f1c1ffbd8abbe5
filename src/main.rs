use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use incident_relay::comms::local_api;
use incident_relay::relay::config::Config;
use incident_relay::relay::RequestOrchestrator;
use incident_relay::utils;

// sysexits(3)
const EX_DATAERR: u8 = 65;
const EX_TEMPFAIL: u8 = 75;

#[derive(Parser)]
#[command(name = "incident-relay", version, about = "Relay approval requests to PagerDuty incidents")]
struct AppCli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a single queue event read from a file or stdin
    Handle {
        /// Event file; stdin when omitted
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Accept pushed queue events over HTTP
    Serve {
        #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
        port: u16,
    },
}

fn read_event(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading event file {path}")),
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("reading event from stdin")?;
            Ok(raw)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = Config::from_env().context("loading configuration")?;
    let orchestrator = RequestOrchestrator::from_config(&config)?;

    match command {
        Commands::Handle { file } => {
            let raw = read_event(file.as_deref())?;
            match orchestrator.handle(&raw).await {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) if err.is_retryable() => {
                    error!(kind = err.kind(), "retryable failure, message should be redelivered");
                    Ok(ExitCode::from(EX_TEMPFAIL))
                }
                Err(err) => {
                    error!(kind = err.kind(), "permanent failure, message should be dropped");
                    Ok(ExitCode::from(EX_DATAERR))
                }
            }
        }
        Commands::Serve { port } => {
            info!("Starting relay endpoint on port {port}");
            local_api::serve(orchestrator, port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::logging::init();

    let args = AppCli::parse();
    match run(args.command).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal startup error");
            ExitCode::FAILURE
        }
    }
}
