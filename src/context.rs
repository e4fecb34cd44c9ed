//! Shared service context

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{config::Config, stats::StatsHandle};

/// State shared by every connection of one server instance
pub struct ServiceContext {
    config: Config,
    stats: StatsHandle,
    active: AtomicUsize,
}

impl ServiceContext {
    pub fn new(config: Config, stats: StatsHandle) -> ServiceContext {
        ServiceContext {
            config,
            stats,
            active: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    /// Number of currently admitted connections
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Admits one connection, or reports a rejection when the limit is hit
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let n = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        if n > self.config.max_concurrent_connections {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.stats.rejected();
            return None;
        }

        self.stats.accepted();
        Some(ConnectionGuard { context: self.clone() })
    }
}

/// Admission slot held for the lifetime of one client connection
///
/// Dropping the guard releases the slot and reports the disconnect.
pub struct ConnectionGuard {
    context: Arc<ServiceContext>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let n = self.context.active.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("connection finished, {} active", n);
        self.context.stats.disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NullStatsObserver;

    #[tokio::test]
    async fn gate_admits_up_to_limit() {
        let config = Config {
            max_concurrent_connections: 2,
            ..Config::default()
        };
        let stats = StatsHandle::new(Box::new(NullStatsObserver), config.max_recent_errors);
        let context = Arc::new(ServiceContext::new(config, stats));

        let first = context.try_acquire().unwrap();
        let _second = context.try_acquire().unwrap();
        assert!(context.try_acquire().is_none());
        assert_eq!(context.active_connections(), 2);

        drop(first);
        assert_eq!(context.active_connections(), 1);
        assert!(context.try_acquire().is_some());
    }
}
