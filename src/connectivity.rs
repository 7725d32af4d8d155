//! Host connectivity signalling.
//!
//! [`Connectivity`] is a cloneable online/offline flag backed by a tokio
//! `watch` channel. The host flips it with [`Connectivity::set_online`];
//! queue managers and stores observe transitions through
//! [`Connectivity::subscribe`] to trigger replays and syncs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::Result;

#[derive(Debug, Clone, Copy)]
struct State {
    online: bool,
    /// Offline→online transitions so far.
    reconnects: u64,
}

/// Shared online/offline state.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<State>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(State {
            online,
            reconnects: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Update the state. Subscribers are only woken on actual transitions.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.reconnects += 1;
            }
            true
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    /// Watch for reconnects that happen after this call.
    pub fn subscribe(&self) -> ConnectivityWatch {
        let rx = self.tx.subscribe();
        let seen = rx.borrow().reconnects;
        ConnectivityWatch { rx, seen }
    }
}

/// Observer of offline→online transitions.
///
/// Transitions are counted by the sender, so a reconnect is never missed,
/// even one immediately followed by another disconnect.
pub struct ConnectivityWatch {
    rx: watch::Receiver<State>,
    seen: u64,
}

impl ConnectivityWatch {
    pub fn is_online(&self) -> bool {
        self.rx.borrow().online
    }

    /// Wait for the next reconnect not yet reported. Several reconnects
    /// between two calls are reported once.
    ///
    /// Returns `false` once the [`Connectivity`] is gone.
    pub async fn next_online(&mut self) -> bool {
        loop {
            let reconnects = self.rx.borrow_and_update().reconnects;
            if reconnects > self.seen {
                self.seen = reconnects;
                return true;
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

/// Optional host capability: ask the platform to wake us for replay once
/// connectivity returns.
///
/// Registration is best-effort; the queue manager works without it through
/// explicit and online-triggered drains.
#[async_trait]
pub trait ReplayRegistrar: Send + Sync {
    async fn register(&self, tag: &str) -> Result<()>;
}
