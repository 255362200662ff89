//! Connectivity state shared by the submission path and the sync loop.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::RemoteStore;

/// Current connectivity plus change notification.
///
/// Platform integrations (or the HTTP probe below) call [`set_connected`];
/// consumers read [`is_connected`] or wait for [`ConnectivityEvents::regained`].
///
/// [`set_connected`]: NetworkMonitor::set_connected
/// [`is_connected`]: NetworkMonitor::is_connected
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<LinkState>>,
}

#[derive(Debug, Clone, Copy)]
struct LinkState {
    connected: bool,
    /// Number of false→true transitions so far; survives watch coalescing.
    regains: u64,
}

/// Subscription that yields on every false→true transition.
#[derive(Debug)]
pub struct ConnectivityEvents {
    rx: watch::Receiver<LinkState>,
    seen: u64,
}

impl NetworkMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(LinkState {
            connected: initially_connected,
            regains: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().connected
    }

    /// Update the state; only real changes notify subscribers.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.connected == connected {
                return false;
            }
            if connected {
                state.regains += 1;
            }
            state.connected = connected;
            true
        });
        if changed {
            info!(connected, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> ConnectivityEvents {
        let rx = self.tx.subscribe();
        let seen = rx.borrow().regains;
        ConnectivityEvents { rx, seen }
    }

    /// Poll `remote.ping()` every `interval` and mirror the result into the monitor.
    pub fn spawn_probe(&self, remote: Arc<dyn RemoteStore>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match tokio::time::timeout(interval, remote.ping()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        debug!(%err, "connectivity probe failed");
                        false
                    }
                    Err(_) => false,
                };
                monitor.set_connected(reachable);
            }
        })
    }
}

impl ConnectivityEvents {
    /// Resolves on the next offline→online transition; `None` once the monitor is gone.
    pub async fn regained(&mut self) -> Option<()> {
        loop {
            self.rx.changed().await.ok()?;
            let regains = self.rx.borrow_and_update().regains;
            if regains > self.seen {
                self.seen = regains;
                return Some(());
            }
        }
    }
}
