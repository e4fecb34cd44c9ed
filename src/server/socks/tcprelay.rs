//! SOCKS5 TCP handler

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use log::{debug, error, trace, warn};
use tokio::net::{TcpStream, UdpSocket};

use crate::{
    context::{ConnectionGuard, ServiceContext},
    net::ignore_until_end,
    relay::{
        socks5::{
            self, Address, Command, Error as Socks5Error, HandshakeRequest, HandshakeResponse, Reply,
            TcpRequestHeader, TcpResponseHeader,
        },
        tcp::{connect_target, establish_tcp_tunnel},
    },
    stats::FailureKind,
};

use super::udprelay::UdpRelaySession;

/// Handler for one detected SOCKS5 client connection
pub struct Socks5TcpHandler {
    context: Arc<ServiceContext>,
}

impl Socks5TcpHandler {
    pub fn new(context: Arc<ServiceContext>) -> Socks5TcpHandler {
        Socks5TcpHandler { context }
    }

    pub async fn handle_socks5_client(
        self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        _guard: ConnectionGuard,
    ) -> io::Result<()> {
        // 1. Handshake
        let handshake_req = match HandshakeRequest::read_from(&mut stream).await {
            Ok(r) => r,
            Err(Socks5Error::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                trace!("socks5 handshake early eof. peer: {}", peer_addr);
                return Ok(());
            }
            Err(err) => {
                error!("socks5 handshake error: {}", err);
                self.context
                    .stats()
                    .failed(FailureKind::Malformed, format!("socks5 handshake from {peer_addr}: {err}"));
                return Err(err.into());
            }
        };

        trace!("socks5 {:?}", handshake_req);

        if !handshake_req.methods.contains(&socks5::SOCKS5_AUTH_METHOD_NONE) {
            let resp = HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE);
            resp.write_to(&mut stream).await?;

            self.context.stats().failed(
                FailureKind::Unsupported,
                format!("socks5 client {peer_addr} offered no supported auth method"),
            );
            return Err(io::Error::other("no supported socks5 authentication method"));
        }

        let resp = HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_NONE);
        resp.write_to(&mut stream).await?;

        // 2. Fetch the command header
        let header = match TcpRequestHeader::read_from(&mut stream).await {
            Ok(h) => h,
            Err(err) => {
                error!("failed to get TcpRequestHeader: {}, peer: {}", err, peer_addr);
                self.context
                    .stats()
                    .failed(FailureKind::Malformed, format!("socks5 request from {peer_addr}: {err}"));
                let rh = TcpResponseHeader::new(err.as_reply(), unspecified_address());
                rh.write_to(&mut stream).await?;
                return Err(err.into());
            }
        };

        trace!("socks5 {:?} peer: {}", header, peer_addr);

        let addr = header.address;

        // 3. Handle the command
        match header.command {
            Command::TcpConnect => {
                debug!("CONNECT {}", addr);

                self.handle_tcp_connect(stream, peer_addr, addr).await
            }
            Command::UdpAssociate => {
                debug!("UDP ASSOCIATE from {}", peer_addr);

                self.handle_udp_associate(stream, peer_addr).await
            }
            Command::TcpBind => {
                warn!("BIND is not supported");
                self.context
                    .stats()
                    .failed(FailureKind::Unsupported, format!("socks5 BIND from {peer_addr}"));
                let rh = TcpResponseHeader::new(Reply::CommandNotSupported, addr);
                rh.write_to(&mut stream).await?;

                Ok(())
            }
        }
    }

    async fn handle_tcp_connect(
        self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        target_addr: Address,
    ) -> io::Result<()> {
        self.context.stats().socks5_connection_started();

        let mut remote = match connect_target(&target_addr, self.context.config().connect_timeout).await {
            Ok(remote) => {
                // Tell the client that we are ready
                let header = TcpResponseHeader::new(Reply::Succeeded, unspecified_address());
                header.write_to(&mut stream).await?;

                trace!("sent header: {:?}", header);

                remote
            }
            Err(err) => {
                error!("socks5 CONNECT {} failed, error: {}", target_addr, err);
                self.context
                    .stats()
                    .failed(FailureKind::UpstreamConnect, format!("socks5 CONNECT {target_addr}: {err}"));

                let header = TcpResponseHeader::new(Reply::HostUnreachable, unspecified_address());
                header.write_to(&mut stream).await?;
                return Err(err);
            }
        };

        debug!("established tcp tunnel {} <-> {}", peer_addr, target_addr);

        establish_tcp_tunnel(&mut stream, &mut remote, peer_addr, &target_addr).await
    }

    async fn handle_udp_associate(self, mut stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
            Ok(s) => s,
            Err(err) => {
                error!("socks5 UDP ASSOCIATE bind failed, error: {}", err);
                self.context
                    .stats()
                    .failed(FailureKind::UdpBind, format!("udp associate bind: {err}"));

                let rh = TcpResponseHeader::new(Reply::GeneralFailure, unspecified_address());
                rh.write_to(&mut stream).await?;
                return Err(err);
            }
        };

        let relay_port = socket.local_addr()?.port();
        let rh = TcpResponseHeader::new(
            Reply::Succeeded,
            Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, relay_port))),
        );
        rh.write_to(&mut stream).await?;

        debug!("socks5 UDP relay for {} listening on port {}", peer_addr, relay_port);
        self.context.stats().udp_session_started();

        let session = UdpRelaySession::new(self.context.clone(), socket);
        let mut relay_handle = tokio::spawn(session.run());

        // The session lives exactly as long as the TCP control connection;
        // it may also end itself when its idle deadline fires.
        tokio::select! {
            _ = ignore_until_end(&mut stream) => {
                trace!("socks5 UDP ASSOCIATE control connection {} closed", peer_addr);
            }
            _ = &mut relay_handle => {
                trace!("socks5 UDP relay session for {} ended", peer_addr);
            }
        }

        relay_handle.abort();
        self.context.stats().udp_session_ended();

        Ok(())
    }
}

fn unspecified_address() -> Address {
    Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
}
