//! Command-line and environment configuration

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Lobby server for real-time party games")]
pub struct Config {
    /// Address to bind the WebSocket listener to
    #[clap(short = 'H', long, env = "HTTP_ADDRESS", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on
    #[clap(short, long, env = "HTTP_PORT", default_value = "8080")]
    pub port: u16,
    /// Maximum number of simultaneous connections
    #[clap(short, long, env = "MAX_CONNECTIONS", default_value = "256")]
    pub max_connections: usize,
    /// Upper bound for a single store call, in milliseconds
    #[clap(long, env = "STORE_TIMEOUT_MS", default_value = "2000")]
    pub store_timeout_ms: u64,
    /// Pending commands the coordinator queue holds before senders wait
    #[clap(long, env = "QUEUE_CAPACITY", default_value = "1000")]
    pub queue_capacity: usize,
    /// Frames a connection may have waiting to be written before it is dropped
    #[clap(long, env = "OUTBOX_CAPACITY", default_value = "64")]
    pub outbox_capacity: usize,
    /// Snapshot file for persistent games; in-memory when absent
    #[clap(short, long, env = "LOBBY_DATA_FILE")]
    pub data_file: Option<PathBuf>,
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 256,
            store_timeout_ms: 2000,
            queue_capacity: 1000,
            outbox_capacity: 64,
            data_file: None,
        }
    }
}
