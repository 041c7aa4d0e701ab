use clap::Parser;

use crate::{
    listener::DEFAULT_BACKLOG,
    message::{MAX_READ_CHUNK_SIZE, READ_CHUNK_SIZE},
    relay::RelayConfig,
};

pub const USAGE: &str = "Usage: broadcast-relay <port>";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TCP port to listen on, on every local interface. Use 0 for an ephemeral port.
    #[arg(allow_negative_numbers = true)]
    pub port: i64,

    /// Number of read events to service before any queued message is written.
    #[arg(long, default_value_t = 0)]
    pub min_events_before_flush: u64,

    /// Maximum bytes taken from a client per read, and so the largest message size.
    #[arg(
        long,
        default_value_t = READ_CHUNK_SIZE as u32,
        value_parser = clap::value_parser!(u32).range(1..=MAX_READ_CHUNK_SIZE as i64)
    )]
    pub read_chunk_size: u32,

    /// Pending connections the kernel may queue before they are accepted.
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,
}

impl Cli {
    /// Builds the relay configuration, or `None` when the port is unusable.
    pub fn relay_config(&self) -> Option<RelayConfig> {
        let port = u16::try_from(self.port).ok()?;
        Some(RelayConfig {
            min_events_before_flush: self.min_events_before_flush,
            read_chunk_size: usize::try_from(self.read_chunk_size).ok()?,
            backlog: self.backlog,
            ..RelayConfig::on_port(port)
        })
    }
}
