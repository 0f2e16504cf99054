//! vmrelay daemon binary.
//!
//! # Usage
//!
//! ```bash
//! # Under a service manager passing the listening socket (production)
//! vmrelayd
//!
//! # Binding a path directly (development)
//! vmrelayd --socket /run/vmrelay/proxy.sock
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::net::UnixListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vmrelayd::{DaemonError, Proxy, take_activation_listener};

/// Proxy between container tooling and in-VM agents
#[derive(Parser, Debug)]
#[command(name = "vmrelayd")]
#[command(about = "vmrelay proxy daemon")]
#[command(version)]
struct Args {
    /// Path to bind the client socket at, when not socket-activated
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let listener = match take_activation_listener()? {
        Some(listener) => {
            tracing::info!("adopted activated listening socket");
            listener
        }
        None => {
            let path = args.socket.ok_or_else(|| {
                DaemonError::Config("no activated socket and no --socket path given".into())
            })?;
            tracing::info!(path = %path.display(), "binding client socket");
            std::os::unix::net::UnixListener::bind(&path).map_err(DaemonError::Listener)?
        }
    };

    listener.set_nonblocking(true).map_err(DaemonError::Listener)?;
    let listener = UnixListener::from_std(listener).map_err(DaemonError::Listener)?;

    tracing::info!("vmrelayd ready");

    let proxy = Arc::new(Proxy::new());
    proxy.run(listener).await;

    Ok(())
}
