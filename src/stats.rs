//! Statistics collaborator
//!
//! The proxy core reports lifecycle events to a host-provided observer. All
//! observer calls happen on one dedicated task, in event order, so
//! implementations need no locking of their own.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::mpsc;

/// Observer of proxy lifecycle events
pub trait StatsObserver: Send + 'static {
    /// A client connection was admitted
    fn accepted(&mut self) {}
    /// An admitted client connection finished
    fn disconnected(&mut self) {}
    /// A client connection was turned away by the concurrency gate
    fn rejected(&mut self) {}
    /// Something went wrong; `description` is human readable
    fn failed(&mut self, _description: &str) {}
    /// A SOCKS5 CONNECT command was accepted
    fn socks5_connection_started(&mut self) {}
    /// A UDP ASSOCIATE relay session was set up
    fn udp_session_started(&mut self) {}
    /// A UDP relay session was torn down
    fn udp_session_ended(&mut self) {}
    /// One client datagram was forwarded to its target
    fn udp_packet_relayed(&mut self) {}
}

/// Observer that ignores every event
pub struct NullStatsObserver;

impl StatsObserver for NullStatsObserver {}

/// Classification of a recorded failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed request or handshake
    Malformed,
    /// Unsupported method or command
    Unsupported,
    /// Upstream connect failed or timed out
    UpstreamConnect,
    /// I/O error while relaying
    Relay,
    /// Client idle deadline expired
    IdleTimeout,
    /// UDP relay socket could not be bound
    UdpBind,
}

impl fmt::Display for FailureKind {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FailureKind::Malformed       => f.write_str("malformed request"),
            FailureKind::Unsupported     => f.write_str("unsupported operation"),
            FailureKind::UpstreamConnect => f.write_str("upstream connect failure"),
            FailureKind::Relay           => f.write_str("relay failure"),
            FailureKind::IdleTimeout     => f.write_str("idle timeout"),
            FailureKind::UdpBind         => f.write_str("udp bind failure"),
        }
    }
}

/// One recorded failure
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub message: String,
    pub at: SystemTime,
}

enum StatsEvent {
    Accepted,
    Disconnected,
    Rejected,
    Failed(String),
    Socks5ConnectionStarted,
    UdpSessionStarted,
    UdpSessionEnded,
    UdpPacketRelayed,
}

/// Cheap handle for reporting events from I/O tasks
///
/// Events are queued and delivered to the observer by a dedicated task, so
/// reporting never blocks an I/O loop.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<StatsEvent>,
    recent_errors: Arc<Mutex<VecDeque<ErrorRecord>>>,
    max_recent_errors: usize,
}

impl StatsHandle {
    /// Spawns the dispatch task serializing events onto `observer`
    pub fn new(mut observer: Box<dyn StatsObserver>, max_recent_errors: usize) -> StatsHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    StatsEvent::Accepted => observer.accepted(),
                    StatsEvent::Disconnected => observer.disconnected(),
                    StatsEvent::Rejected => observer.rejected(),
                    StatsEvent::Failed(description) => observer.failed(&description),
                    StatsEvent::Socks5ConnectionStarted => observer.socks5_connection_started(),
                    StatsEvent::UdpSessionStarted => observer.udp_session_started(),
                    StatsEvent::UdpSessionEnded => observer.udp_session_ended(),
                    StatsEvent::UdpPacketRelayed => observer.udp_packet_relayed(),
                }
            }
        });

        StatsHandle {
            tx,
            recent_errors: Arc::new(Mutex::new(VecDeque::new())),
            max_recent_errors,
        }
    }

    fn send(&self, ev: StatsEvent) {
        // The dispatch task only dies when the handle is dropped
        let _ = self.tx.send(ev);
    }

    pub fn accepted(&self) {
        self.send(StatsEvent::Accepted);
    }

    pub fn disconnected(&self) {
        self.send(StatsEvent::Disconnected);
    }

    pub fn rejected(&self) {
        self.send(StatsEvent::Rejected);
    }

    pub fn socks5_connection_started(&self) {
        self.send(StatsEvent::Socks5ConnectionStarted);
    }

    pub fn udp_session_started(&self) {
        self.send(StatsEvent::UdpSessionStarted);
    }

    pub fn udp_session_ended(&self) {
        self.send(StatsEvent::UdpSessionEnded);
    }

    pub fn udp_packet_relayed(&self) {
        self.send(StatsEvent::UdpPacketRelayed);
    }

    /// Records a failure in the ring and notifies the observer
    pub fn failed(&self, kind: FailureKind, message: String) {
        let description = format!("{kind}: {message}");

        {
            let mut ring = match self.recent_errors.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if ring.len() == self.max_recent_errors {
                ring.pop_front();
            }
            ring.push_back(ErrorRecord {
                kind,
                message,
                at: SystemTime::now(),
            });
        }

        self.send(StatsEvent::Failed(description));
    }

    /// Snapshot of the most recent failures, oldest first
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        let ring = match self.recent_errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_ring_is_bounded() {
        let handle = StatsHandle::new(Box::new(NullStatsObserver), 3);

        for i in 0..5 {
            handle.failed(FailureKind::Relay, format!("error {i}"));
        }

        let errors = handle.recent_errors();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].message, "error 2");
        assert_eq!(errors[2].message, "error 4");
        assert!(errors.iter().all(|e| e.kind == FailureKind::Relay));
    }
}
