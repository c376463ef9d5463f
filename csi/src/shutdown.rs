//! Graceful shutdown plumbing: a broadcast stop signal plus in-flight
//! operation tracking so the drain window can be enforced. The
//! transport adapter wraps each request in an `OperationGuard`; once
//! the signal fires it stops admitting new requests, waits for the
//! guards to drop within the window, then force-closes the appliance
//! pool.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    inflight: Arc<AtomicUsize>,
}

pub struct OperationGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Receiver that flips to true when shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Admit one operation. `None` once shutdown has been requested.
    pub fn admit(&self) -> Option<OperationGuard> {
        if *self.sender.borrow() {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        Some(OperationGuard {
            inflight: self.inflight.clone(),
        })
    }

    pub fn requested(&self) -> bool {
        *self.sender.borrow()
    }

    /// Signal shutdown and wait for in-flight operations to finish,
    /// up to `window`. Returns true on a clean drain.
    pub async fn request_and_drain(&self, window: Duration) -> bool {
        info!("shutdown requested, draining in-flight operations");
        let _ = self.sender.send(true);

        let give_up = tokio::time::Instant::now() + window;
        loop {
            let inflight = self.inflight.load(Ordering::SeqCst);
            if inflight == 0 {
                info!("drain complete");
                return true;
            }
            if tokio::time::Instant::now() >= give_up {
                warn!(
                    "drain window expired with {} operations in flight",
                    inflight
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_until_requested() {
        let shutdown = Shutdown::new();
        let guard = shutdown.admit().unwrap();
        assert!(!shutdown.requested());
        drop(guard);

        assert!(shutdown.request_and_drain(Duration::from_millis(100)).await);
        assert!(shutdown.requested());
        assert!(shutdown.admit().is_none());
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let shutdown = Shutdown::new();
        let guard = shutdown.admit().unwrap();

        let drainer = shutdown.clone();
        let handle = tokio::spawn(async move {
            drainer.request_and_drain(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn drain_window_is_bounded() {
        let shutdown = Shutdown::new();
        let _guard = shutdown.admit().unwrap();
        assert!(
            !shutdown.request_and_drain(Duration::from_millis(100)).await
        );
    }
}
