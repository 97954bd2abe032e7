//! PolyWire CLI
//!
//! Two-peer secure chat over the TCP channel: exchange public keys, run the
//! four-message handshake, then chat under the session key.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use tracing_subscriber::EnvFilter;

mod app;

const APP_QUALIFIER: &str = "org";
const APP_ORG: &str = "polywire";
const APP_NAME: &str = "polywire";
const DEFAULT_PORT: u16 = 4711;

#[derive(Parser)]
#[command(name = "polywire")]
#[command(about = "PolyWire - secure two-peer messaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Key store directory (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the local identity and key fingerprint
    ShowId,

    /// Wait for a peer to connect
    Listen {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to bind; another one is picked if it is taken
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Connect to a listening peer
    Connect {
        /// Peer address, host:port
        #[arg(short, long)]
        addr: SocketAddr,

        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Seconds per connection attempt, 0 waits forever
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Own phone number to announce to the peer
    #[arg(long)]
    phone: Option<String>,
}

fn store_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".polywire"))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| anyhow!("invalid log filter: {e}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let dir = store_dir(cli.store);
    let store = app::open_store(&dir).with_context(|| format!("opening {}", dir.display()))?;

    match cli.command {
        Commands::ShowId => app::show_id(&store),
        Commands::Listen {
            bind,
            port,
            session,
        } => {
            let options = app::SessionOptions {
                address: SocketAddr::new(bind, port),
                server: true,
                timeout_secs: session.timeout,
                attempts: session.attempts,
                phone: session.phone,
            };
            app::run(store, options).await
        }
        Commands::Connect { addr, session } => {
            let options = app::SessionOptions {
                address: addr,
                server: false,
                timeout_secs: session.timeout,
                attempts: session.attempts,
                phone: session.phone,
            };
            app::run(store, options).await
        }
    }
}
