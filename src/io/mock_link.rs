//! In-memory device link for unit tests
//!
//! Records every frame sent, lets tests inject inbound messages or failures,
//! and can be told to fail connects or sends.

use crate::io::error::LinkError;
use crate::io::link::{DeviceEndpoint, DeviceLink, DeviceMessage, LinkFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct MockLink {
    name: String,
    sent: Mutex<Vec<Vec<u8>>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Result<DeviceMessage, LinkError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<DeviceMessage, LinkError>>>,
    connected_tx: watch::Sender<bool>,
}

impl MockLink {
    pub fn new(name: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            connected_tx,
        }
    }

    pub fn push_message(&self, message: DeviceMessage) {
        let _ = self.inbound_tx.send(Ok(message));
    }

    pub fn push_failure(&self) {
        let _ = self.inbound_tx.send(Err(LinkError::Disconnected));
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected_tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectTimeout { addr: self.name.clone(), timeout_ms: 0 });
        }
        self.set_connected(true);
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(LinkError::WriteTimeout);
        }
        self.sent.lock().push(bytes.to_vec());
        Ok(())
    }

    async fn receive(&self) -> Result<DeviceMessage, LinkError> {
        let mut rx = self.inbound_rx.lock().await;
        let result = rx.recv().await.unwrap_or(Err(LinkError::Disconnected));
        if result.is_err() {
            self.set_connected(false);
        }
        result
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }
}

/// Hands out one shared `MockLink` per device name
#[derive(Default)]
pub struct MockLinkFactory {
    links: Mutex<FxHashMap<String, Arc<MockLink>>>,
}

impl MockLinkFactory {
    pub fn link(&self, name: &str) -> Arc<MockLink> {
        self.links.lock().entry(name.to_string()).or_insert_with(|| Arc::new(MockLink::new(name))).clone()
    }
}

impl LinkFactory for MockLinkFactory {
    fn create(&self, endpoint: &DeviceEndpoint) -> Arc<dyn DeviceLink> {
        self.link(&endpoint.name)
    }
}
