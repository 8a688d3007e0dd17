use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use voicelink_core::config::{reconnect_delay_from_millis, AgentConfig};
use voicelink_core::host::{Agent, ProcessHost};
use voicelink_core::negotiator::RtcNegotiatorFactory;
use voicelink_core::telemetry::logging::{self, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "voicelink", about = "Audio streaming agent driven through a signaling relay")]
struct Cli {
    /// WebSocket address of the relay (overrides VOICELINK_RELAY_URL)
    #[arg(long)]
    relay_url: Option<String>,

    /// Identity to register with the relay
    #[arg(long)]
    client_id: Option<String>,

    /// Controller every offer is addressed to
    #[arg(long)]
    peer_id: Option<String>,

    /// Delay before re-dialing a lost relay, 0 disables
    #[arg(long)]
    reconnect_ms: Option<u64>,

    #[arg(long, value_enum, env = "VOICELINK_LOG_LEVEL", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "VOICELINK_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, mut config: AgentConfig) -> AgentConfig {
        if let Some(url) = &self.relay_url {
            config.relay_url = url.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = peer_id.clone();
        }
        if let Some(millis) = self.reconnect_ms {
            config.reconnect_delay = reconnect_delay_from_millis(millis);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = logging::init(&log_config) {
        eprintln!("voicelink: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target = "host", "{err:#}");
            tracing::info!(target = "host", "stopping");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.apply(AgentConfig::from_env());
    let host = Arc::new(ProcessHost::new(config.capture_permitted));
    let agent = Agent::start(config, host, Arc::new(RtcNegotiatorFactory::new()))
        .await
        .context("agent failed to start")?;

    let interrupted = tokio::signal::ctrl_c().await;
    tracing::info!(target = "host", "shutdown requested");
    agent.shutdown().await;
    interrupted.context("failed to listen for ctrl-c")
}
