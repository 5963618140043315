use std::sync::Mutex;
use tillsync_api::{NetworkMonitor, NetworkState};
use tokio::sync::watch;

/// A network monitor toggled by the test driver.
pub struct ManualNetwork {
    state: Mutex<NetworkState>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ManualNetwork {
    pub fn new(online: bool) -> Self {
        let (tx, rx) = watch::channel(online);
        Self {
            state: Mutex::new(NetworkState {
                connected: online,
                internet_reachable: online,
            }),
            tx,
            rx,
        }
    }

    /// Flips connectivity and notifies subscribers of the transition.
    pub fn set_online(&self, online: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = online;
            state.internet_reachable = online;
        }
        let _ = self.tx.send(online);
    }

    /// Connected to an access point with no internet behind it.
    pub fn set_captive(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = true;
            state.internet_reachable = false;
        }
        let _ = self.tx.send(false);
    }
}

impl NetworkMonitor for ManualNetwork {
    fn state(&self) -> NetworkState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}
