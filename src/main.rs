use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedgate::feed::UpstreamTransformer;
use feedgate::{App, Config, Server};

/// Feed-filtering HTTP proxy.
#[derive(Debug, Parser)]
#[command(name = "feedgate", version, about)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(long, value_name = "ADDR")]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref())?;
    if let Some(bind_address) = cli.bind_address {
        config.bind_address = bind_address;
    }

    let transformer = Arc::new(UpstreamTransformer::new(config.feed.fetch_timeout)?);
    let app = App::new(&config, transformer, None)?;
    let server = Server::bind(&config.bind_address).await?;

    app.serve(server, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
    })
    .await?;

    info!("feedgate stopped");
    Ok(())
}
