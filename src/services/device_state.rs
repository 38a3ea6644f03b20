//! Device connectivity map
//!
//! Holds the last known connected flag per device name and republishes every
//! transition as a `DeviceStatusEvent` on a broadcast channel.

use crate::domain::types::DeviceStatusEvent;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const STATUS_CHANNEL_CAPACITY: usize = 64;

pub struct DeviceStates {
    states: RwLock<FxHashMap<String, bool>>,
    events: broadcast::Sender<DeviceStatusEvent>,
}

impl DeviceStates {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self { states: RwLock::new(FxHashMap::default()), events }
    }

    /// Replace the known device set, keeping flags of devices that stay
    pub fn register<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut states = self.states.write();
        let mut next = FxHashMap::default();
        for name in names {
            let connected = states.get(name).copied().unwrap_or(false);
            next.insert(name.to_string(), connected);
        }
        *states = next;
    }

    /// Record a connectivity flag; returns true when it changed
    pub fn set(&self, name: &str, connected: bool) -> bool {
        let changed = {
            let mut states = self.states.write();
            match states.get_mut(name) {
                Some(current) if *current == connected => false,
                Some(current) => {
                    *current = connected;
                    true
                }
                None => {
                    states.insert(name.to_string(), connected);
                    true
                }
            }
        };

        if changed {
            info!(device = %name, connected = connected, "device_status_changed");
            // No subscribers is fine
            let _ = self.events.send(DeviceStatusEvent { device: name.to_string(), connected });
        }
        changed
    }

    pub fn mark_all_disconnected(&self) {
        let names: Vec<String> = self.states.read().keys().cloned().collect();
        for name in names {
            self.set(&name, false);
        }
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.states.read().get(name).copied()
    }

    /// All devices sorted by name
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        let mut all: Vec<(String, bool)> =
            self.states.read().iter().map(|(name, &connected)| (name.clone(), connected)).collect();
        all.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceStatusEvent> {
        self.events.subscribe()
    }
}

impl Default for DeviceStates {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror a link's connected flag into the map until the link goes away
pub fn spawn_status_forwarder(
    name: String,
    mut connected: watch::Receiver<bool>,
    states: Arc<DeviceStates>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while connected.changed().await.is_ok() {
            let flag = *connected.borrow_and_update();
            states.set(&name, flag);
        }
        debug!(device = %name, "device_status_forwarder_ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_transitions_only() {
        let states = DeviceStates::new();
        states.register(["trigger", "lane-1"]);
        assert_eq!(states.get("trigger"), Some(false));

        assert!(states.set("trigger", true));
        assert!(!states.set("trigger", true));
        assert!(states.set("trigger", false));
        assert_eq!(states.get("unknown"), None);
    }

    #[test]
    fn test_register_keeps_existing_flags() {
        let states = DeviceStates::new();
        states.register(["trigger", "lane-1"]);
        states.set("lane-1", true);

        states.register(["lane-1", "lane-2"]);
        assert_eq!(
            states.snapshot(),
            vec![("lane-1".to_string(), true), ("lane-2".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_events_published() {
        let states = DeviceStates::new();
        let mut rx = states.subscribe();

        states.set("plc", true);
        states.set("plc", true);
        states.mark_all_disconnected();

        assert_eq!(rx.recv().await.unwrap(), DeviceStatusEvent { device: "plc".into(), connected: true });
        assert_eq!(rx.recv().await.unwrap(), DeviceStatusEvent { device: "plc".into(), connected: false });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_mirrors_watch() {
        let states = Arc::new(DeviceStates::new());
        let mut events = states.subscribe();
        let (tx, rx) = watch::channel(false);

        let handle = spawn_status_forwarder("lane-1".to_string(), rx, states.clone());
        tx.send(true).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, DeviceStatusEvent { device: "lane-1".into(), connected: true });
        assert_eq!(states.get("lane-1"), Some(true));

        drop(tx);
        handle.await.unwrap();
    }
}
