//! Multi-channel daemon.
//!
//! Owns one transport per enabled logical channel, seals outgoing messages
//! through the [`EncryptionPolicy`] and opens incoming envelopes before they
//! reach the [`SessionListener`].
//!
//! # Failure Semantics
//!
//! - `send` never fails past this boundary. Rejections come back as `false`
//!   plus a [`SendOutcome::Failed`] callback.
//! - Received envelopes that fail framing, integrity or crypto checks are
//!   logged and dropped. The channel stays up.
//! - Transports report through a weak handle, so dropping the daemon
//!   silences them even if a task is still winding down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use polywire_core::envelope::LENGTH_PREFIX_SIZE;
use polywire_core::{EncryptionPolicy, KeyStore, Message, MessageType, ProtocolError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::{ChannelId, NetworkAddress, ServiceDescriptor};
use crate::error::TransportError;
use crate::tcp::IpTransport;
use crate::transport::{ConnectionState, DaemonHandle, Transport, TransportEvents, TransportFactory};

/// Result of a send, delivered after the fact.
#[derive(Debug)]
pub enum SendOutcome {
    /// The envelope was written to the channel.
    Sent {
        /// Channel used.
        channel: ChannelId,
        /// Wire type of the envelope.
        msg_type: MessageType,
        /// Envelope size including header.
        length: usize,
    },
    /// The message did not leave.
    Failed {
        /// Channel the send targeted, if one was resolved.
        channel: Option<ChannelId>,
        /// Why.
        error: TransportError,
    },
}

/// Application-facing callbacks. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait SessionListener: Send + Sync {
    /// A channel connected to a peer.
    fn on_connection_established(&self, channel: ChannelId, address: NetworkAddress) {}
    /// A channel gave up connecting.
    fn on_connection_failed(&self, channel: ChannelId, address: NetworkAddress) {}
    /// A send finished or was rejected. Delivered from a runtime task, never
    /// from inside `Daemon::send`.
    fn on_message_sent(&self, outcome: SendOutcome) {}
    /// A message arrived and passed every check.
    fn on_message_received(&self, channel: ChannelId, msg_type: MessageType, message: Message) {}
    /// A channel's connection went away.
    fn on_connection_closed(&self, channel: ChannelId) {}
    /// A channel was torn down for good.
    fn on_channel_destroyed(&self, channel: ChannelId) {}
}

/// Listener callbacks as values.
#[derive(Debug)]
pub enum SessionEvent {
    /// See [`SessionListener::on_connection_established`].
    ConnectionEstablished {
        /// Channel.
        channel: ChannelId,
        /// Peer address.
        address: NetworkAddress,
    },
    /// See [`SessionListener::on_connection_failed`].
    ConnectionFailed {
        /// Channel.
        channel: ChannelId,
        /// Address that could not be reached.
        address: NetworkAddress,
    },
    /// See [`SessionListener::on_message_sent`].
    MessageSent(SendOutcome),
    /// See [`SessionListener::on_message_received`].
    MessageReceived {
        /// Channel.
        channel: ChannelId,
        /// Wire type.
        msg_type: MessageType,
        /// Decoded message.
        message: Message,
    },
    /// See [`SessionListener::on_connection_closed`].
    ConnectionClosed(ChannelId),
    /// See [`SessionListener::on_channel_destroyed`].
    ChannelDestroyed(ChannelId),
}

/// Listener that forwards every callback into an unbounded queue.
pub struct EventListener {
    tx: UnboundedSender<SessionEvent>,
}

impl EventListener {
    /// Create the listener and the receiving end of its queue.
    pub fn channel() -> (Arc<Self>, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("session event dropped, receiver gone");
        }
    }
}

impl SessionListener for EventListener {
    fn on_connection_established(&self, channel: ChannelId, address: NetworkAddress) {
        self.forward(SessionEvent::ConnectionEstablished { channel, address });
    }

    fn on_connection_failed(&self, channel: ChannelId, address: NetworkAddress) {
        self.forward(SessionEvent::ConnectionFailed { channel, address });
    }

    fn on_message_sent(&self, outcome: SendOutcome) {
        self.forward(SessionEvent::MessageSent(outcome));
    }

    fn on_message_received(&self, channel: ChannelId, msg_type: MessageType, message: Message) {
        self.forward(SessionEvent::MessageReceived {
            channel,
            msg_type,
            message,
        });
    }

    fn on_connection_closed(&self, channel: ChannelId) {
        self.forward(SessionEvent::ConnectionClosed(channel));
    }

    fn on_channel_destroyed(&self, channel: ChannelId) {
        self.forward(SessionEvent::ChannelDestroyed(channel));
    }
}

/// Transports available in this build: TCP for the IP channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardTransports;

impl TransportFactory for StandardTransports {
    fn create(&self, channel: ChannelId, handle: DaemonHandle) -> Option<Arc<dyn Transport>> {
        if channel.is_ip() {
            Some(Arc::new(IpTransport::new(handle)))
        } else {
            None
        }
    }
}

type TransportMap = HashMap<ChannelId, Arc<dyn Transport>>;

struct DaemonInner {
    policy: EncryptionPolicy,
    factory: Box<dyn TransportFactory>,
    enabled: Vec<ChannelId>,
    transports: RwLock<Option<TransportMap>>,
    selected: RwLock<Option<ChannelId>>,
    listener: RwLock<Option<Arc<dyn SessionListener>>>,
}

impl DaemonInner {
    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.read().clone()
    }

    fn notify(&self, f: impl FnOnce(&dyn SessionListener)) {
        if let Some(listener) = self.listener() {
            f(listener.as_ref());
        }
    }
}

impl TransportEvents for DaemonInner {
    fn on_connection_established(&self, channel: ChannelId, address: NetworkAddress) {
        info!(%channel, %address, "connection established");
        self.notify(|l| l.on_connection_established(channel, address));
    }

    fn on_connection_failed(&self, channel: ChannelId, address: NetworkAddress) {
        warn!(%channel, %address, "connection failed");
        self.notify(|l| l.on_connection_failed(channel, address));
    }

    fn on_data_sent(&self, channel: ChannelId, bytes: Vec<u8>, success: bool) {
        let msg_type = bytes
            .get(LENGTH_PREFIX_SIZE)
            .and_then(|b| MessageType::from_byte(*b).ok());
        let outcome = match (success, msg_type) {
            (true, Some(msg_type)) => SendOutcome::Sent {
                channel,
                msg_type,
                length: bytes.len(),
            },
            (true, None) => SendOutcome::Failed {
                channel: Some(channel),
                error: ProtocolError::MalformedEnvelope.into(),
            },
            (false, _) => SendOutcome::Failed {
                channel: Some(channel),
                error: TransportError::WriteFailed(channel),
            },
        };
        self.notify(|l| l.on_message_sent(outcome));
    }

    fn on_data_received(&self, channel: ChannelId, bytes: Vec<u8>) {
        let peer = self.policy.store().partner_id();
        // Failures are logged inside the policy; the message is dropped here.
        if let Ok((msg_type, message)) = self.policy.extract_received(peer, &bytes) {
            debug!(%channel, %msg_type, kind = message.kind(), "message received");
            self.notify(|l| l.on_message_received(channel, msg_type, message));
        }
    }

    fn on_connection_closed(&self, channel: ChannelId) {
        info!(%channel, "connection closed");
        self.notify(|l| l.on_connection_closed(channel));
    }

    fn on_destroyed(&self, channel: ChannelId) {
        debug!(%channel, "channel destroyed");
        self.notify(|l| l.on_channel_destroyed(channel));
    }
}

/// Coordinates the transports of one peer. Cheap to clone.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Daemon using the standard transports for `enabled` channels.
    pub fn new(store: Arc<KeyStore>, enabled: Vec<ChannelId>) -> Self {
        Self::with_factory(store, enabled, Box::new(StandardTransports))
    }

    /// Daemon building its transports with `factory`.
    pub fn with_factory(
        store: Arc<KeyStore>,
        enabled: Vec<ChannelId>,
        factory: Box<dyn TransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                policy: EncryptionPolicy::new(store),
                factory,
                enabled,
                transports: RwLock::new(None),
                selected: RwLock::new(None),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Get the encryption policy.
    pub fn policy(&self) -> &EncryptionPolicy {
        &self.inner.policy
    }

    /// Get the key store.
    pub fn store(&self) -> &Arc<KeyStore> {
        self.inner.policy.store()
    }

    /// Install or clear the listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn SessionListener>>) {
        *self.inner.listener.write() = listener;
    }

    /// Build transports for the enabled channels. Runs once; later calls do
    /// nothing. Wifi and mobile internet share one transport.
    pub fn ensure_initialized(&self) {
        let mut guard = self.inner.transports.write();
        if guard.is_some() {
            return;
        }

        let events: Arc<dyn TransportEvents> = self.inner.clone();
        let mut map = TransportMap::new();
        for &channel in &self.inner.enabled {
            let logical = channel.logical();
            if map.contains_key(&logical) {
                continue;
            }
            match self
                .inner
                .factory
                .create(channel, DaemonHandle::for_events(channel, &events))
            {
                Some(transport) => {
                    debug!(%channel, "transport created");
                    map.insert(logical, transport);
                }
                None => info!(%channel, "no transport available for channel"),
            }
        }
        *guard = Some(map);
    }

    /// Channels with a live transport.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.transports().into_iter().map(|t| t.channel()).collect()
    }

    /// Transport serving `channel`.
    pub fn transport(&self, channel: ChannelId) -> Option<Arc<dyn Transport>> {
        self.inner
            .transports
            .read()
            .as_ref()
            .and_then(|map| map.get(&channel.logical()).cloned())
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.inner
            .transports
            .read()
            .as_ref()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Connection state of `channel`, if it has a transport.
    pub fn state(&self, channel: ChannelId) -> Option<ConnectionState> {
        self.transport(channel).map(|t| t.state())
    }

    /// Choose the channel `send` uses.
    pub fn select_channel(&self, channel: ChannelId) {
        info!(%channel, "channel selected");
        *self.inner.selected.write() = Some(channel);
    }

    /// Get the selected channel.
    pub fn selected_channel(&self) -> Option<ChannelId> {
        *self.inner.selected.read()
    }

    /// Start connecting every transport. The descriptor may be rewritten by a
    /// transport that had to rebind.
    pub fn establish_connection(&self, descriptor: &mut ServiceDescriptor) {
        self.ensure_initialized();
        for transport in self.transports() {
            transport.setup_connection(descriptor);
        }
    }

    /// Start reading on `channel`.
    pub fn listen(&self, channel: ChannelId) -> bool {
        match self.transport(channel) {
            Some(transport) => transport.listen_for_messages(),
            None => false,
        }
    }

    /// Seal and send over the selected channel.
    pub fn send(&self, message: &Message, msg_type: MessageType) -> bool {
        match self.selected_channel() {
            Some(channel) => self.send_on(channel, message, msg_type),
            None => {
                warn!(%msg_type, "send without a selected channel");
                self.report_rejected(None, TransportError::NoChannelSelected);
                false
            }
        }
    }

    /// Seal and send over `channel`.
    pub fn send_on(&self, channel: ChannelId, message: &Message, msg_type: MessageType) -> bool {
        match self.try_send(channel, message, msg_type) {
            Ok(()) => true,
            Err(error) => {
                warn!(%channel, %msg_type, %error, "send rejected");
                self.report_rejected(Some(channel), error);
                false
            }
        }
    }

    /// Rejections reach the listener from a task, like write results do.
    /// Without a runtime the callback runs inline.
    fn report_rejected(&self, channel: Option<ChannelId>, error: TransportError) {
        let outcome = SendOutcome::Failed { channel, error };
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { inner.notify(|l| l.on_message_sent(outcome)) });
            }
            Err(_) => inner.notify(|l| l.on_message_sent(outcome)),
        }
    }

    fn try_send(
        &self,
        channel: ChannelId,
        message: &Message,
        msg_type: MessageType,
    ) -> Result<(), TransportError> {
        let transport = self
            .transport(channel)
            .filter(|t| t.is_ready())
            .ok_or(TransportError::ChannelNotReady(channel))?;
        let peer = self.store().partner_id();
        let wire = self.inner.policy.prepare_for_sending(peer, message, msg_type)?;
        if !transport.send_raw(wire) {
            return Err(TransportError::ChannelNotReady(channel));
        }
        Ok(())
    }

    /// Drop every current connection, keeping the transports.
    pub async fn stop_connections(&self) {
        for transport in self.transports() {
            transport.stop_current_connection().await;
        }
    }

    /// Destroy every transport. Calling it again does nothing.
    pub async fn teardown(&self) {
        let taken = self.inner.transports.write().take();
        let Some(map) = taken else {
            return;
        };
        info!(channels = map.len(), "tearing down");
        for transport in map.into_values() {
            transport.destroy().await;
        }
    }
}
