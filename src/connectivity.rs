//! §6 "Connectivity contract" — connectivity probing itself is out of
//! scope (§1); only the contract the engine consumes is defined here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait Connectivity: Send + Sync {
    /// One-shot probe.
    async fn check_now(&self) -> bool;

    /// Current cached value, updated as the probe's stream emits.
    fn is_connected(&self) -> bool;

    /// A stream of connectivity transitions, used by `RequestQueueManager`
    /// and `BackgroundSyncManager` to react to flips (§4.2, §4.8).
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A simple in-process connectivity tracker: an atomic flag plus a
/// `tokio::sync::watch` channel, fed by whatever platform probe the host
/// application wires in. Good enough as the engine's default; hosts with a
/// real network-reachability API supply their own `Connectivity` impl.
pub struct WatchConnectivity {
    flag: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl WatchConnectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { flag: Arc::new(AtomicBool::new(initially_online)), tx }
    }

    pub fn set(&self, online: bool) {
        self.flag.store(online, Ordering::SeqCst);
        let _ = self.tx.send(online);
    }
}

#[async_trait]
impl Connectivity for WatchConnectivity {
    async fn check_now(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flips_propagate_to_subscribers() {
        let conn = WatchConnectivity::new(true);
        let mut rx = conn.subscribe();
        assert!(conn.check_now().await);
        conn.set(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(!conn.is_connected());
    }
}
