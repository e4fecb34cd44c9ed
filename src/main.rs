//! Thin CLI host around the proxy core

use std::io;

use clap::Parser;
use log::{debug, info, warn};

use mixport::{Config, Server, StatsObserver};

#[derive(Parser, Debug)]
#[command(name = "mixport", about = "Single-port HTTP + SOCKS5 forwarding proxy")]
struct Opts {
    /// Listening port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 64)]
    max_connections: usize,
}

/// Observer that mirrors proxy events into the log
struct LogObserver;

impl StatsObserver for LogObserver {
    fn accepted(&mut self) {
        debug!("client accepted");
    }

    fn rejected(&mut self) {
        warn!("client rejected: connection limit reached");
    }

    fn failed(&mut self, description: &str) {
        warn!("{}", description);
    }

    fn socks5_connection_started(&mut self) {
        debug!("socks5 connection started");
    }

    fn udp_session_started(&mut self) {
        debug!("udp session started");
    }

    fn udp_session_ended(&mut self) {
        debug!("udp session ended");
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    let config = Config {
        port: opts.port,
        max_concurrent_connections: opts.max_connections,
        ..Config::default()
    };

    let server = Server::bind(config, Box::new(LogObserver)).await?;

    tokio::select! {
        r = server.run() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
