//! Relaybot main binary: a WhatsApp AI auto-responder.

mod adapters;
mod config;
mod gateway;
mod history;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "relaybot", version, about = "Relaybot WhatsApp AI auto-responder")]
struct Cli {
    /// Config file (default: ~/.relaybot/config.toml).
    #[arg(long, global = true, env = "RELAYBOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the webhook server (default).
    Serve,
    /// Validate config and report which integrations are configured.
    Doctor,
    /// One-shot text message to a WhatsApp number.
    Send { recipient: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("relaybot: failed to load .env: {e}");
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Send { recipient, message } => {
            server::send_one_shot(cli.config, &recipient, &message).await
        }
    }
}

const DEFAULT_LOG_FILTER: &str =
    "info,relaybot=debug,rb_app=debug,rb_core=debug,rb_channels=debug,rb_llm=debug,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "unsupported RELAYBOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let log_format: LogFormat = std::env::var("RELAYBOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .parse()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    match log_format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(
        log_format = ?log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            panic_location = %location,
            panic_payload = %panic_payload_to_string(panic_info.payload()),
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
