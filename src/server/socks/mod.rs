//! SOCKS5 pipeline

pub use self::tcprelay::Socks5TcpHandler;

mod tcprelay;
mod udprelay;
