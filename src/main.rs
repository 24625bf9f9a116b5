use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

use findoutmole::comms::api::{self, PredictionResponse};
use findoutmole::config::Config;
use findoutmole::inference::InferenceEngine;
use findoutmole::utils;

const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_PORT: u16 = 8000;

#[derive(Parser)]
#[command(name = "findoutmole", version, about = "FindOutMole skin lesion classifier")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(long, default_value_t = DEFAULT_HOST)]
        host: IpAddr,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Classify a local image file and print the prediction as JSON
    Classify {
        image: PathBuf,
    },
}

async fn run_serve(config: Config, host: IpAddr, port: u16) -> Result<()> {
    let addr = SocketAddr::new(host, port);
    info!(version = findoutmole::VERSION, "Starting FindOutMole API on {}", addr);
    api::serve(config, addr).await
}

fn run_classify(config: &Config, image: &Path) -> Result<()> {
    let engine = InferenceEngine::from_weights(&config.model_path)?;
    let bytes = std::fs::read(image).with_context(|| format!("reading '{}'", image.display()))?;
    let result = engine.classify(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&PredictionResponse::from(result))?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Some(Commands::Serve { host, port }) => run_serve(config, host, port).await?,
        Some(Commands::Classify { image }) => {
            tokio::task::spawn_blocking(move || run_classify(&config, &image)).await??
        }
        None => run_serve(config, DEFAULT_HOST, DEFAULT_PORT).await?,
    }

    Ok(())
}
