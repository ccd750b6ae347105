use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[path = "../executor/mod.rs"]
mod executor;
#[path = "../shared/logging.rs"]
mod logging;

#[derive(Parser)]
#[command(name = "copilot-executor")]
#[command(about = "Copilot MCP executor - runs analytics copilot tasks against an MCP tool server")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "COPILOT_EXECUTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory (overrides the configuration file)
    #[arg(long, env = "COPILOT_LOG_DIR")]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a single task request and stream JSON lines to stdout
    Run {
        /// Task request file, or - for stdin
        #[arg(long, default_value = "-")]
        context: String,
    },
    /// Serve task execution over HTTP
    Serve {
        #[arg(long, env = "COPILOT_EXECUTOR_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "COPILOT_EXECUTOR_PORT", default_value_t = 9410)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = executor::config::ExecutorConfig::load(args.config.as_deref())?;
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }

    match args.command {
        Command::Run { context } => {
            // stdout carries the JSON lines
            let _ = logging::init_service_logging(
                &config.log_dir,
                "copilot_executor",
                logging::ConsoleTarget::Stderr,
            );
            executor::run_once(config, &context).await
        }
        Command::Serve { host, port } => {
            let _ = logging::init_service_logging(
                &config.log_dir,
                "copilot_executor",
                logging::ConsoleTarget::Stdout,
            );
            executor::run_server(config, &host, port).await
        }
    }
}
