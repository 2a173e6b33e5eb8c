use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::server::Server;

#[derive(Args)]
pub struct ServeArgs {
    /// Override the configured bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the configured bind address
    #[arg(short, long)]
    pub bind: Option<String>,
}

pub async fn run(args: ServeArgs, config_path: Option<&str>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    Server::new(&config)?.run().await
}
