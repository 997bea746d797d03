use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{Level, info};

use tidepool::client::{App, Outcome};
use tidepool::config::Config;
use tidepool::transport::SessionLink;
use tidepool::upload::HttpTransfers;

#[derive(Parser, Debug)]
#[command(name = "tidepool")]
struct Cli {
    /// Session server address, e.g. "127.0.0.1:10101" or "wss://host"
    #[arg(long, short = 's', env = "TIDEPOOL_SESSION_SERVER")]
    server: Option<String>,

    /// Initial address-bar fragment to merge into the first sync
    #[arg(long)]
    fragment: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.session_server = server;
    }
    info!(server = %config.session_server, "tidepool client starting");

    // A reset frame tears the whole client down; session identity may
    // have changed, so every cycle starts from a fresh connect.
    loop {
        match run_once(&config, cli.fragment.as_deref()).await {
            Outcome::Reload => {
                info!("session reset; reloading");
            }
            Outcome::Shutdown => {
                info!("session link closed; exiting");
                return Ok(());
            }
        }
    }
}

async fn run_once(config: &Config, fragment: Option<&str>) -> Outcome {
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let link = SessionLink::open(config, link_tx);
    let transfers = Arc::new(HttpTransfers::new(config.upload_url()));

    let app = App::new(config, transfers, link.sender(), link_rx);
    if let Some(fragment) = fragment {
        app.handle().set_fragment(fragment);
    }
    app.run().await
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
