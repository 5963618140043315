//! API for platform connectivity reporting.

use tokio::sync::watch;

/// Raw connectivity readings from the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub internet_reachable: bool,
}

impl NetworkState {
    /// The engine's definition of online: a link that actually reaches the
    /// internet, not just an access point.
    pub fn online(&self) -> bool {
        self.connected && self.internet_reachable
    }
}

/// Connectivity seam. Implementations push transitions through a watch
/// channel; the engine reacts to the false -> true edge by resurrecting the
/// dead-letter queue and draining immediately.
pub trait NetworkMonitor: Send + Sync {
    fn state(&self) -> NetworkState;

    fn is_online(&self) -> bool {
        self.state().online()
    }

    /// A receiver that yields the online flag on every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}
