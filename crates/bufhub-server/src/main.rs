//! bufhub allocation server.
//!
//! Creates the shared region and the handshake socket, then serves clients
//! until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=bufhub=debug bufhub-server --slots 7 --region /bufhub --socket /tmp/bufhub.sock
//! ```
//!
//! Unset flags fall back to `BUFHUB_REGION`, `BUFHUB_SOCKET`, `BUFHUB_SLOTS`
//! and `BUFHUB_TIMEOUT_MS`, then to the built-in defaults.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bufhub::{HubConfig, MemfdAllocator, Server, ServerHandle};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bufhub-server")]
#[command(about = "Shared memory buffer allocation server")]
struct Args {
    /// Shared memory object name (e.g. /bufhub)
    #[arg(long)]
    region: Option<String>,

    /// Handshake socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Number of data slots (1-64)
    #[arg(long)]
    slots: Option<u32>,

    /// Worker poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Seconds a client has to complete the handshake
    #[arg(long)]
    handshake_secs: Option<u64>,
}

impl Args {
    fn into_config(self) -> HubConfig {
        let mut config = HubConfig::from_env();
        if let Some(region) = self.region {
            config.region_name = region;
        }
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(slots) = self.slots {
            config.slot_count = slots;
        }
        if let Some(ms) = self.poll_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.handshake_secs {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Args::parse().into_config();
    let server = match Server::bind(config, Arc::new(MemfdAllocator)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(stop_on_signal(server.handle()));

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn stop_on_signal(handle: ServerHandle) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            handle.shutdown();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = terminate.recv() => tracing::info!("SIGTERM received"),
    }
    handle.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "bufhub-server",
            "--slots",
            "3",
            "--socket",
            "/tmp/other.sock",
            "--poll-ms",
            "5",
        ])
        .unwrap();
        let config = args.into_config();
        assert_eq!(config.slot_count, 3);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }
}
