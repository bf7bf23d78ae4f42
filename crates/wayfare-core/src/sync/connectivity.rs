//! Connectivity collaborator: a "check now" probe plus online/offline events

use tokio::sync::watch;

pub trait Connectivity: Send + Sync {
    /// Synchronous probe run at the start of every cycle
    fn is_online(&self) -> bool;
}

/// For shells without a network monitor; requests fail as transport errors instead
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity state fed by the host (OS callbacks, a ping loop, ...)
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    sender: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    /// Publish a new state; listeners only wake on actual changes
    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Receiver used by the sync loop to observe offline→online edges
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }
}
