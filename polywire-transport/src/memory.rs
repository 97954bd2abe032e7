//! In-process loopback transport.
//!
//! Two [`LoopbackEnd`]s are joined by a pair of unbounded queues. Used to
//! drive two daemons against each other without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::config::{ChannelId, ServiceDescriptor};
use crate::tasks::{TaskRegistry, JOIN_TIMEOUT};
use crate::transport::{ConnectionState, DaemonHandle, Transport, TransportFactory};

/// One side of a loopback link.
#[derive(Debug)]
pub struct LoopbackEnd {
    tx: UnboundedSender<Vec<u8>>,
    rx: UnboundedReceiver<Vec<u8>>,
}

/// Create two connected loopback ends.
pub fn loopback_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LoopbackEnd { tx: a_tx, rx: a_rx },
        LoopbackEnd { tx: b_tx, rx: b_rx },
    )
}

/// Transport carrying envelopes over a [`LoopbackEnd`].
pub struct LoopbackTransport {
    channel: ChannelId,
    handle: DaemonHandle,
    state: Arc<Mutex<ConnectionState>>,
    tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>>,
    reading: Arc<AtomicBool>,
    tasks: Mutex<Arc<TaskRegistry>>,
    destroyed: AtomicBool,
}

impl LoopbackTransport {
    /// Wrap one end of a loopback link.
    pub fn new(end: LoopbackEnd, handle: DaemonHandle) -> Self {
        Self {
            channel: handle.channel(),
            handle,
            state: Arc::new(Mutex::new(ConnectionState::None)),
            tx: Mutex::new(Some(end.tx)),
            rx: Arc::new(tokio::sync::Mutex::new(end.rx)),
            reading: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Arc::new(TaskRegistry::new())),
            destroyed: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> Arc<TaskRegistry> {
        self.tasks.lock().clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn setup_connection(&self, descriptor: &mut ServiceDescriptor) {
        if self.destroyed.load(Ordering::SeqCst) || self.tx.lock().is_none() {
            return;
        }
        *self.state.lock() = ConnectionState::Connected;
        let handle = self.handle.clone();
        let address = descriptor.server_address().clone();
        self.registry()
            .spawn_cancellable(async move { handle.connection_established(address) });
    }

    fn send_raw(&self, bytes: Vec<u8>) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let accepted = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(bytes.clone()).is_ok(),
            None => false,
        };
        if accepted {
            let handle = self.handle.clone();
            self.registry()
                .spawn_cancellable(async move { handle.data_sent(bytes, true) });
        }
        accepted
    }

    fn listen_for_messages(&self) -> bool {
        if self.state() != ConnectionState::Connected || self.reading.swap(true, Ordering::SeqCst) {
            return false;
        }
        let rx = self.rx.clone();
        let reading = self.reading.clone();
        let state = self.state.clone();
        let handle = self.handle.clone();
        self.registry().spawn_cancellable(async move {
            let mut rx = rx.lock().await;
            while let Some(bytes) = rx.recv().await {
                handle.data_received(bytes);
            }
            debug!("loopback peer went away");
            reading.store(false, Ordering::SeqCst);
            *state.lock() = ConnectionState::None;
            handle.connection_closed();
        });
        true
    }

    async fn stop_current_connection(&self) {
        let registry = std::mem::replace(&mut *self.tasks.lock(), Arc::new(TaskRegistry::new()));
        registry.shutdown(JOIN_TIMEOUT).await;
        self.reading.store(false, Ordering::SeqCst);
        let was_active = std::mem::replace(&mut *self.state.lock(), ConnectionState::None)
            != ConnectionState::None;
        if was_active {
            self.handle.connection_closed();
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_current_connection().await;
        self.tx.lock().take();
        self.handle.destroyed();
    }
}

/// Factory handing out pre-paired loopback ends per channel.
#[derive(Default)]
pub struct LoopbackFactory {
    ends: Mutex<HashMap<ChannelId, LoopbackEnd>>,
}

impl LoopbackFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Two factories whose transports on each of `channels` are linked.
    pub fn linked(channels: &[ChannelId]) -> (Self, Self) {
        let left = Self::new();
        let right = Self::new();
        for &channel in channels {
            let (a, b) = loopback_pair();
            left.ends.lock().insert(channel, a);
            right.ends.lock().insert(channel, b);
        }
        (left, right)
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, channel: ChannelId, handle: DaemonHandle) -> Option<Arc<dyn Transport>> {
        let end = self.ends.lock().remove(&channel)?;
        Some(Arc::new(LoopbackTransport::new(end, handle)))
    }
}
