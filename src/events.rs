//! Typed event bus.
//!
//! Registries and the tracker publish change events; panels and tests
//! subscribe. Delivery is in publish order, fan-out over channels, and never
//! re-enters the publisher.

use crate::tracker::PannerKey;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperEvent {
    ClientAdded(u16),
    ClientRemoved(u16),
    ClientsActivationChanged,
    PluginAdded(u16),
    PluginUpdated(u16),
    PluginRemoved(u16),
    PluginSettingsUpdated(u16),
    PannerAdded(PannerKey),
    PannerUpdated(PannerKey),
    PannerRemoved(PannerKey),
}

/// Fan-out bus. Subscribers that drop their receiver are pruned on the next
/// publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<HelperEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<HelperEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: HelperEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
