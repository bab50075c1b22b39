mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use fanout_sfu::{RtcEngine, SfuManager};

use config::Config;
use server::FanoutServer;

/// Fanout WebRTC SFU
///
/// Every stream a participant publishes is forwarded to every other
/// participant connected over the websocket signaling endpoint.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "FANOUT_CONFIG")]
    config: Option<String>,

    /// HTTP service address, e.g. `:8080` or `127.0.0.1:8080`
    #[arg(long, env = "FANOUT_ADDR")]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = &args.addr {
        config.server.apply_listen_address(addr)?;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Fanout starting...");
    info!(
        "Configuration loaded: HTTP={}, ICE servers={:?}, UDP ports={}-{}",
        config.http_address(),
        config.sfu.rtc.ice_servers,
        config.sfu.rtc.udp_port_min,
        config.sfu.rtc.udp_port_max
    );

    // 4. Build the SFU
    let engine = RtcEngine::new(config.sfu.rtc.clone());
    let manager = SfuManager::new(engine, config.sfu.clone());

    // 5. Serve until shutdown
    FanoutServer::new(config, manager).start().await
}
