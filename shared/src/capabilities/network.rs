use tokio::sync::watch;
use tracing::info;

/// Connectivity as seen by the device.
///
/// `is_online` is a synchronous poll; `subscribe` yields every
/// online/offline transition so the sync engine can redrive its queue the
/// moment connectivity comes back.
pub trait NetworkStateSource: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Network state fed by the host shell.
///
/// The platform layer forwards its native connectivity callbacks into
/// [`ManualNetwork::set_online`]. Tests drive it directly.
#[derive(Debug)]
pub struct ManualNetwork {
    tx: watch::Sender<bool>,
}

impl ManualNetwork {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Returns true when the state actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network state changed");
        }
        changed
    }
}

impl Default for ManualNetwork {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkStateSource for ManualNetwork {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_online_reports_transitions_only() {
        let net = ManualNetwork::offline();
        assert!(!net.is_online());
        assert!(net.set_online(true));
        assert!(!net.set_online(true));
        assert!(net.is_online());
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let net = ManualNetwork::online();
        let mut rx = net.subscribe();
        net.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
