//! mixport — a single-port HTTP + SOCKS5 forwarding proxy
//!
//! One TCP listener accepts both HTTP/HTTPS proxy traffic and SOCKS5 traffic.
//! The first byte of every fresh connection decides which protocol it speaks:
//! `0x05` selects the SOCKS5 pipeline, anything else the HTTP pipeline.
//!
//! - HTTP `CONNECT` and SOCKS5 `CONNECT` open a raw TCP upstream and tunnel
//!   bytes verbatim in both directions.
//! - Plain HTTP requests are forwarded with hop-by-hop headers scrubbed and
//!   the URI rewritten to origin form.
//! - SOCKS5 `UDP ASSOCIATE` binds a datagram relay that multiplexes one
//!   client-facing socket onto per-target outbound sockets.
//!
//! The core is driven by a host application: it reports lifecycle events to a
//! [`StatsObserver`] and stops when the future returned by [`run`] (or
//! [`Server::run`]) is dropped.
//!
//! ```no_run
//! use mixport::{Config, NullStatsObserver};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     mixport::run(Config::default(), Box::new(NullStatsObserver)).await
//! }
//! ```

pub use self::{
    config::Config,
    server::Server,
    stats::{ErrorRecord, FailureKind, NullStatsObserver, StatsHandle, StatsObserver},
};

pub mod config;
pub mod context;
pub mod net;
pub mod relay;
pub mod server;
pub mod stats;

use std::io;

/// Binds a server and runs its accept loop
pub async fn run(config: Config, observer: Box<dyn StatsObserver>) -> io::Result<()> {
    let server = Server::bind(config, observer).await?;
    server.run().await
}
