//! Colombo operator CLI
//!
//! ## Commands
//!
//! ### config show
//! Print the resolved configuration as JSON:
//! ```bash
//! colombo --config ./colombo.toml config show
//! colombo config show --path     # only the file location
//! ```
//!
//! ### ping
//! Send ping requests through a local bus and report their round trips:
//! ```bash
//! colombo --log colombo=debug ping --count 5
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colombo::{
    ColomboBuilder, ColomboConfig, HandleContext, Request, RequestHeader, RequestKind,
    RequestHandler, Response, ResponseHeader, TracingAlerter,
};

#[derive(Parser, Debug)]
#[command(name = "colombo")]
#[command(about = "Colombo message bus tooling")]
struct Cli {
    /// Tracing filter directives (overrides COLOMBO_LOG and the config file)
    #[arg(long, global = true)]
    log: Option<String>,

    /// Config file (defaults to ~/.colombo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Send ping requests through a local bus
    Ping {
        /// Number of pings sent in one batch
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the resolved configuration as JSON
    Show {
        /// Print the config file location instead
        #[arg(long)]
        path: bool,
    },
}

#[derive(Clone, Debug, Default)]
struct PingRequest {
    header: RequestHeader,
    sequence: usize,
}

#[derive(Clone, Debug, Default)]
struct PingResponse {
    header: ResponseHeader,
    sequence: usize,
}

impl Request for PingRequest {
    type Response = PingResponse;
    const KIND: RequestKind = RequestKind::SideEffectFree;

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }
}

impl Response for PingResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}

struct PingHandler;

impl RequestHandler<PingRequest> for PingHandler {
    async fn handle(&self, request: &PingRequest, _cx: &HandleContext<'_>) -> Result<PingResponse> {
        Ok(PingResponse {
            sequence: request.sequence,
            ..PingResponse::default()
        })
    }
}

async fn ping(config: ColomboConfig, count: usize) -> Result<()> {
    let colombo = ColomboBuilder::new()
        .with_config(config)
        .request_handler::<PingRequest, _>(PingHandler)
        .alerter(TracingAlerter)
        .build()?;

    let started = Instant::now();
    let mut batch = colombo.bus().batch();
    let keys: Vec<_> = (0..count)
        .map(|sequence| {
            batch.add(PingRequest {
                sequence,
                ..PingRequest::default()
            })
        })
        .collect();
    let mut responses = batch.send().await?;
    let elapsed = started.elapsed();

    for key in keys {
        let response = responses.take_key(key)?;
        let correlation_id = response
            .header()
            .correlation_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        println!("pong {} {}", response.sequence, correlation_id);
    }
    println!("{count} ping(s) in {}ms", elapsed.as_millis());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ColomboConfig::load_or_default(cli.config.as_deref())?;
    let filter = colombo::logging::resolve_filter(cli.log.as_deref(), &config.logging);
    colombo::logging::init(&filter)?;

    match cli.command {
        Command::Config {
            command: ConfigCommand::Show { path },
        } => {
            if path {
                let path = cli
                    .config
                    .or_else(ColomboConfig::default_path)
                    .context("could not determine the home directory")?;
                println!("{}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
        Command::Ping { count } => {
            if count == 0 {
                anyhow::bail!("--count must be at least 1");
            }
            ping(config, count).await?;
        }
    }

    Ok(())
}
