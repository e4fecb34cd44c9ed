//! Raw TCP upstream connect and bidirectional tunnel

use std::{io, net::SocketAddr, time::Duration};

use log::trace;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    net::TcpStream,
    time,
};

use super::socks5::Address;

/// Opens a raw TCP connection to `addr`, honoring the connect deadline
pub async fn connect_target(addr: &Address, timeout: Duration) -> io::Result<TcpStream> {
    let connect = async {
        match *addr {
            Address::SocketAddress(sa) => TcpStream::connect(sa).await,
            Address::DomainNameAddress(ref domain, port) => TcpStream::connect((domain.as_str(), port)).await,
        }
    };

    match time::timeout(timeout, connect).await {
        Ok(r) => r,
        Err(..) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

/// Shuttles bytes between `plain` and `remote` until either side finishes
///
/// EOF on one socket shuts down the write half of the other; an error on
/// either side tears down both. Reads are driven by the opposite side's
/// writability, so a slow consumer throttles its producer.
pub async fn establish_tcp_tunnel<P, S>(
    plain: &mut P,
    remote: &mut S,
    peer_addr: SocketAddr,
    target_addr: &Address,
) -> io::Result<()>
where
    P: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match copy_bidirectional(plain, remote).await {
        Ok((rn, wn)) => {
            trace!(
                "tcp tunnel {} <-> {} closed, L2R {} bytes, R2L {} bytes",
                peer_addr, target_addr, rn, wn
            );
            Ok(())
        }
        Err(err) => {
            trace!("tcp tunnel {} <-> {} closed with error: {}", peer_addr, target_addr, err);
            Err(err)
        }
    }
}
