use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use common_net::telemetry;
use server::{BoxError, ServerConfig, ServerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "WebRTC signaling relay")]
struct ServerCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "ADDR")]
    gateway_bind: Option<SocketAddr>,

    #[arg(long, value_name = "HOST")]
    turn_host: Option<String>,

    #[arg(long, value_name = "SECS")]
    turn_ttl: Option<u64>,

    #[arg(long, value_name = "SECS")]
    stale_timeout: Option<u64>,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_stun: bool,
}

impl ServerCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("SERVER_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut ServerSettings) {
        if let Some(addr) = self.gateway_bind {
            settings.gateway.bind_addr = addr;
        }
        if let Some(host) = &self.turn_host {
            settings.gateway.turn.host = host.clone();
        }
        if let Some(ttl) = self.turn_ttl {
            settings.gateway.turn.ttl_secs = ttl;
        }
        if let Some(secs) = self.stale_timeout {
            settings.reaper.stale_timeout_secs = secs;
        }
        if self.no_stun {
            settings.gateway.turn.include_stun = false;
        }
    }
}

fn build_config(cli: &ServerCli) -> Result<ServerConfig, BoxError> {
    let mut settings = if let Some(path) = cli.resolve_config_path() {
        ServerSettings::from_file(&path)?
    } else {
        ServerSettings::from_env()?
    };

    cli.apply_overrides(&mut settings);

    settings.into_config()
}

#[tokio::main]
async fn main() {
    telemetry::init("server");

    let cli = ServerCli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "server: could not build configuration");
            return;
        }
    };

    if let Err(err) = server::run_with_ctrl_c(config).await {
        tracing::error!(%err, "server exited with an error");
    }
}
