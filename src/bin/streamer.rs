//! Stream push and pull tool.

use clap::{Parser, Subcommand};
use std::time::Duration;
use streamer::relay::{FlvPuller, Manager, RtmpPusher};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "streamer", version = "1.0.0", about = "Stream push and pull tool")]
struct Cli {
    /// Log level: DEBUG, INFO, WARN, ERROR, FATAL or PANIC
    #[arg(short = 'l', long, global = true, default_value = "INFO")]
    log_level: String,

    /// Emit JSON log lines instead of colorized console output
    #[arg(long, global = true)]
    log_json: bool,

    /// How long to run before exiting cleanly
    #[arg(short = 'd', long, global = true, default_value = "60s", value_parser = humantime::parse_duration)]
    duration: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish an FLV source (file or HTTP URL) to an RTMP endpoint
    Push {
        /// Upstream RTMP URL
        #[arg(short = 'u', long)]
        url: String,
        /// File path or HTTP-FLV URL to publish
        #[arg(short = 'f', long)]
        file: String,
    },
    /// Pull an HTTP-FLV stream, writing it to a file or discarding it
    Pull {
        /// Downstream HTTP-FLV URL
        #[arg(short = 'u', long)]
        url: String,
        /// Output file; omitted output is discarded
        #[arg(short = 'f', long)]
        file: Option<String>,
    },
}

fn init_logger(level: &str, json: bool) {
    // FATAL/PANIC collapse onto ERROR, tracing's most severe level
    let level = match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" => "warn",
        "ERROR" | "FATAL" | "PANIC" => "error",
        other => {
            eprintln!("unknown log level {other}, defaulting to info");
            "info"
        }
    };
    let filter = EnvFilter::new(level);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    tracing::info!(log_level = level, json, "logger initialized");
}

async fn run(cli: Cli) -> streamer::Result<()> {
    let manager = Manager::new();
    match cli.command {
        Command::Push { url, file } => {
            let mut pusher = RtmpPusher::new(url, file);
            manager.launch("push", &mut pusher, cli.duration).await
        }
        Command::Pull { url, file } => match file {
            Some(path) => {
                let out = tokio::fs::File::create(&path).await?;
                let mut puller = FlvPuller::new(url, out);
                manager.launch("pull", &mut puller, cli.duration).await
            }
            None => {
                let mut puller = FlvPuller::new(url, tokio::io::sink());
                manager.launch("pull", &mut puller, cli.duration).await
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_json);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "streamer failed");
        std::process::exit(1);
    }
}
