use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use filesd::StoreLocation;
use tracing_subscriber::EnvFilter;

pub mod api;
pub mod http;

/// Maintains a Prometheus file-based service discovery file from scrape
/// targets registered over HTTP.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Address the registration API listens on
    #[arg(long, env = "FILESD_GEND_LISTEN", default_value = "127.0.0.1:5555")]
    pub listen: SocketAddr,

    /// Prometheus service discovery file (https://prometheus.io/docs/guides/file-sd/)
    #[arg(long, env = "FILESD_GEND_SD_FILE", default_value = "./sd.json")]
    pub sd_file: PathBuf,

    /// Persistent storage for targets (use ':memory:' to keep nothing across restarts)
    #[arg(long, env = "FILESD_GEND_DB", default_value = "./filesd-gend.db")]
    pub db: StoreLocation,

    /// Debug mode (enables debug logging)
    #[arg(long, env = "FILESD_GEND_DEBUG")]
    pub debug: bool,

    /// Seconds a request waits for the registry before failing
    #[arg(long, env = "FILESD_GEND_REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,

    /// Mutations that may wait for the registry worker before submitters block
    #[arg(long, env = "FILESD_GEND_QUEUE_DEPTH", default_value_t = 64)]
    pub queue_depth: usize,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
/// the defaults picked by `debug`.
pub fn setup_tracing(debug: bool) {
    let default_directives = if debug {
        "filesd=debug,filesd_gend=debug,tower_http=debug"
    } else {
        "filesd=info,filesd_gend=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(debug)
        .with_line_number(debug)
        .init();
}
