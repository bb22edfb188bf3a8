//! One-shot "connected" signal shared by all connections of a tunnel

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Signal fired once a connection has registered with the edge
pub trait ConnectedFuse: Send + Sync {
    /// Mark the tunnel as connected. Only the first call has any effect.
    fn connected(&self);

    /// Whether any connection has registered yet
    fn is_connected(&self) -> bool;
}

/// Fuse that blows at most once
///
/// The compare-and-set on `fused` decides the single winner; the watch channel
/// only exists so other tasks can await the transition.
#[derive(Debug)]
pub struct BooleanFuse {
    fused: AtomicBool,
    notify: watch::Sender<bool>,
}

impl BooleanFuse {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            fused: AtomicBool::new(false),
            notify,
        }
    }

    /// Blow the fuse. Returns `true` only for the call that performed the transition.
    pub fn fuse(&self) -> bool {
        let won = self
            .fused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.send_replace(true);
        }
        won
    }

    pub fn value(&self) -> bool {
        self.fused.load(Ordering::Acquire)
    }

    /// Wait until the fuse has blown
    pub async fn wait_connected(&self) {
        let mut rx = self.notify.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|fused| *fused).await;
    }
}

impl Default for BooleanFuse {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectedFuse for BooleanFuse {
    fn connected(&self) {
        self.fuse();
    }

    fn is_connected(&self) -> bool {
        self.value()
    }
}
