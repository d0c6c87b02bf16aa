//! Online/offline state.
//!
//! [`ConnectivityMonitor`] is a cloneable handle over a `watch` channel:
//! every clone sees the same state, and subscribers only hear about real
//! transitions (setting the current value again is a no-op).

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::constants::PING_TIMEOUT;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a platform online/offline signal. Returns whether the state
    /// actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!("Connectivity changed: {}", ConnectivityState::from(online));
        }
        changed
    }

    pub fn current(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn state(&self) -> ConnectivityState {
        self.current().into()
    }

    /// Receiver that wakes on each transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Invoke `callback` with the current state, then on every transition.
    ///
    /// Must be called inside a tokio runtime. Dropping the returned
    /// [`Subscription`] stops the callbacks.
    pub fn subscribe_fn<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            callback(initial);
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                callback(online);
            }
        });
        Subscription { task }
    }

    /// Ping the remote and fold the answer into the state.
    pub async fn test_connection(&self, remote: &dyn RemoteStore) -> bool {
        let online = match tokio::time::timeout(PING_TIMEOUT, remote.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Connectivity check failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Connectivity check timed out after {:?}", PING_TIMEOUT);
                false
            }
        };
        self.set_online(online);
        online
    }
}

/// Handle for a callback registered with [`ConnectivityMonitor::subscribe_fn`].
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
