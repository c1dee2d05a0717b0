use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::Result;
use clap::Parser;
use ota_core::{ClientConfig, FileStore, OtaClient, Outcome, ThreadTimer, UdpTransport};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "OTA firmware-update client", long_about = None)]
struct Args {
    /// Path to a TOML config file with the node identity
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the downloaded image is staged and committed in
    #[arg(long, default_value = "./ota-store")]
    store_dir: PathBuf,

    /// Local address for the control socket
    #[arg(long, default_value = "[::]:5683")]
    listen: SocketAddr,

    /// Largest image the store accepts, in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_image_size: u32,

    /// Known update server address, skipping discovery
    #[arg(long)]
    server: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load_from_file(path)?,
        None => ClientConfig::default(),
    };
    info!(
        version = config.current_file_version,
        image_type = config.image_type,
        "Starting OTA client"
    );

    let (tx, rx) = mpsc::channel();
    let transport = UdpTransport::bind(args.listen, tx.clone())?;
    let store = FileStore::new(&args.store_dir, args.max_image_size);
    let timer = ThreadTimer::new(tx);

    let mut client = OtaClient::new(config, transport, store, timer);
    client.init()?;
    if let Some(server) = args.server {
        client.set_server(server);
    }
    client.start_discovery()?;

    match client.run(&rx)? {
        Outcome::Reboot => {
            info!("New image committed; exiting for the bootloader to take over");
            Ok(())
        }
        Outcome::Stopped => {
            anyhow::bail!("event channel closed unexpectedly")
        }
    }
}
