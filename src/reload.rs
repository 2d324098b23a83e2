//! Config reload signalling.
//!
//! Writers publish on the bus after persisting a change; the orchestrator's
//! listener reloads the affected config from the database.

use tokio::sync::broadcast;
use tracing::debug;

/// Which config was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSignal {
    Levels,
    Debate,
}

/// Publish/subscribe channel for [`ReloadSignal`]s.
#[derive(Debug, Clone)]
pub struct ReloadBus {
    tx: broadcast::Sender<ReloadSignal>,
}

impl ReloadBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Notify listeners. Publishing with no listener is not an error.
    pub fn publish(&self, signal: ReloadSignal) {
        let receivers = self.tx.send(signal).unwrap_or(0);
        debug!(?signal, receivers, "Reload signal published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadSignal> {
        self.tx.subscribe()
    }
}

impl Default for ReloadBus {
    fn default() -> Self {
        Self::new()
    }
}
