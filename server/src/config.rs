//! Command line configuration for the world server.

use crate::geometry::Point;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct ServerConfig {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "2611")]
    pub port: u16,
    /// Directory holding maps/, mapfiles/ and the sprite tables
    #[clap(short, long, default_value = "data")]
    pub data_dir: PathBuf,
    /// Map new players are placed on
    #[clap(long, default_value = "1")]
    pub spawn_map: u16,
    #[clap(long, default_value = "5")]
    pub spawn_x: u8,
    #[clap(long, default_value = "5")]
    pub spawn_y: u8,
    /// Maximum number of simultaneous connections
    #[clap(short, long, default_value = "256")]
    pub max_clients: usize,
    /// Seconds of silence before a client is dropped
    #[clap(long, default_value = "300")]
    pub idle_timeout: u64,
    /// Packets buffered per client before new ones are dropped
    #[clap(long, default_value = "256")]
    pub outbound_queue: usize,
    /// Commands buffered per map
    #[clap(long, default_value = "1024")]
    pub map_inbox: usize,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn spawn_point(&self) -> Point {
        Point::new(self.spawn_x, self.spawn_y)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::parse_from(["server"])
    }
}
