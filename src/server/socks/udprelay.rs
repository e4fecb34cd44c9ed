//! SOCKS5 UDP relay session

use std::{
    io::Cursor,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::{debug, error, trace, warn};
use lru_time_cache::LruCache;
use tokio::{
    net::{UdpSocket, lookup_host},
    sync::mpsc,
    task::JoinHandle,
    time,
};

use crate::{
    context::ServiceContext,
    relay::{
        MAXIMUM_UDP_PAYLOAD_SIZE,
        socks5::{Address, UdpAssociateHeader},
    },
};

/// One UDP ASSOCIATE relay session
///
/// Owns the client-facing datagram socket and every outbound socket created
/// on its behalf. Aborting the session task drops the session, which closes
/// them all.
pub struct UdpRelaySession {
    context: Arc<ServiceContext>,
    socket: Arc<UdpSocket>,
    client_addr: Option<SocketAddr>,
    outbound: LruCache<String, OutboundChannel>,
    keepalive_tx: mpsc::Sender<String>,
    keepalive_rx: mpsc::Receiver<String>,
}

/// Socket bound for one `(targetHost, targetPort)` within a session
struct OutboundChannel {
    socket: Arc<UdpSocket>,
    abortable: JoinHandle<()>,
}

impl Drop for OutboundChannel {
    fn drop(&mut self) {
        self.abortable.abort();
    }
}

impl UdpRelaySession {
    pub fn new(context: Arc<ServiceContext>, socket: UdpSocket) -> UdpRelaySession {
        let timeout = context.config().udp_relay_timeout;
        let (keepalive_tx, keepalive_rx) = mpsc::channel(64);

        UdpRelaySession {
            context,
            socket: Arc::new(socket),
            client_addr: None,
            outbound: LruCache::with_expiry_duration(timeout),
            keepalive_tx,
            keepalive_rx,
        }
    }

    /// Relays datagrams until the session sits idle for the whole deadline
    pub async fn run(mut self) {
        let timeout = self.context.config().udp_relay_timeout;
        let mut buffer = [0u8; MAXIMUM_UDP_PAYLOAD_SIZE];

        loop {
            let deadline = time::sleep(timeout);
            tokio::pin!(deadline);

            tokio::select! {
                r = self.socket.recv_from(&mut buffer) => {
                    let (n, src) = match r {
                        Ok(s) => s,
                        Err(err) => {
                            error!("udp relay session recv_from failed with error: {}", err);
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    self.dispatch(&buffer[..n], src).await;
                }
                Some(key) = self.keepalive_rx.recv() => {
                    // Reply traffic keeps its channel (and the session) alive
                    let _ = self.outbound.get(&key);
                }
                _ = &mut deadline => {
                    debug!("udp relay session idle for {:?}, closing", timeout);
                    break;
                }
            }
        }
    }

    /// Handles one datagram from the client side of the session
    async fn dispatch(&mut self, data: &[u8], src: SocketAddr) {
        if self.client_addr.is_none() {
            // The reply endpoint is learned from the first datagram; the
            // ASSOCIATE command usually advertises 0.0.0.0:0.
            self.client_addr = Some(src);
        }

        // PKT = UdpAssociateHeader + PAYLOAD
        let mut cur = Cursor::new(data);
        let header = match UdpAssociateHeader::read_from(&mut cur).await {
            Ok(h) => h,
            Err(..) => {
                error!("received invalid UDP associate packet: {:?}", ByteStr::new(data));
                return;
            }
        };

        if header.frag != 0 {
            error!("received UDP associate packet with frag != 0, fragments are not supported");
            return;
        }

        let pos = cur.position() as usize;
        let payload = &data[pos..];
        let target = header.address;

        trace!("UDP relay {} -> {}, {} bytes", src, target, payload.len());

        let key = target.to_string();

        if self.outbound.get(&key).is_none() {
            // iter() reclaims expired channels before the cap check
            let _ = self.outbound.iter();
            if self.outbound.len() >= self.context.config().max_udp_outbound_channels {
                warn!("udp outbound channel limit reached, dropping packet for {}", target);
                return;
            }

            let channel = match self.create_channel(&target, key.clone()).await {
                Some(ch) => ch,
                None => return,
            };
            self.outbound.insert(key.clone(), channel);
        }

        let Some(channel) = self.outbound.get(&key) else {
            return;
        };

        match channel.socket.send(payload).await {
            Ok(..) => self.context.stats().udp_packet_relayed(),
            Err(err) => error!("udp relay failed to send to {}, error: {}", target, err),
        }
    }

    async fn create_channel(&mut self, target: &Address, key: String) -> Option<OutboundChannel> {
        let target_addr = match *target {
            Address::SocketAddress(sa) => sa,
            Address::DomainNameAddress(ref dname, port) => match lookup_host((dname.as_str(), port)).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(sa) => sa,
                    None => {
                        warn!("udp relay target {} resolved to no address", target);
                        return None;
                    }
                },
                Err(err) => {
                    warn!("udp relay failed to resolve {}, error: {}", target, err);
                    return None;
                }
            },
        };

        // Outbound address family follows the resolved target
        let bind_addr: SocketAddr = match target_addr {
            SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => s,
            Err(err) => {
                error!("udp relay failed to bind outbound socket, error: {}", err);
                return None;
            }
        };
        if let Err(err) = socket.connect(target_addr).await {
            error!("udp relay failed to connect outbound socket to {}, error: {}", target_addr, err);
            return None;
        }

        let socket = Arc::new(socket);
        let client_addr = self.client_addr?;

        // TARGET -> CLIENT
        let abortable = tokio::spawn(copy_target_to_client(
            self.socket.clone(),
            socket.clone(),
            client_addr,
            target.clone(),
            self.keepalive_tx.clone(),
            key,
        ));

        debug!("created udp outbound channel {} <-> {}", client_addr, target);

        Some(OutboundChannel { socket, abortable })
    }
}

/// Forwards replies from one outbound socket back to the client,
/// re-wrapped with the original target's address form
async fn copy_target_to_client(
    inbound: Arc<UdpSocket>,
    outbound: Arc<UdpSocket>,
    client_addr: SocketAddr,
    target: Address,
    keepalive_tx: mpsc::Sender<String>,
    key: String,
) {
    let mut buffer = [0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
    let mut packet = BytesMut::new();

    loop {
        let n = match outbound.recv(&mut buffer).await {
            Ok(n) => {
                let _ = keepalive_tx.send_timeout(key.clone(), Duration::from_secs(1)).await;
                n
            }
            Err(err) => {
                error!("udp relay failed to receive from {}, error: {}", target, err);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let data = &buffer[..n];
        packet.clear();

        let header = UdpAssociateHeader::new(0, target.clone());
        packet.reserve(header.serialized_len() + n);

        header.write_to_buf(&mut packet);
        packet.put_slice(data);

        if let Err(err) = inbound.send_to(&packet, client_addr).await {
            warn!(
                "udp relay failed to send back to client {}, from target {}, error: {}",
                client_addr, target, err
            );
        }

        trace!("udp relay {} <- {} with {} bytes", client_addr, target, n);
    }
}
