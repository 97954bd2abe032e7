//! Transport contract and the callback handle transports report through.
//!
//! # Contract
//!
//! - `setup_connection`, `send_raw` and `listen_for_messages` never block the
//!   caller. Work happens on background tasks.
//! - Outcomes reach the daemon only through the [`DaemonHandle`] the transport
//!   was built with.
//! - `stop_current_connection` and `destroy` are bounded: tasks get a short
//!   window to finish and are aborted after it.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ChannelId, NetworkAddress, ServiceDescriptor};

/// Where a transport is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Idle or torn down.
    None,
    /// Server side waiting for a peer.
    Listening,
    /// Client side attempting to reach the server.
    Connecting,
    /// Ready to exchange data.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Receiver of transport events. Implemented by the daemon.
pub trait TransportEvents: Send + Sync {
    /// A connection on `channel` is up.
    fn on_connection_established(&self, channel: ChannelId, address: NetworkAddress);
    /// Every attempt to reach `address` failed.
    fn on_connection_failed(&self, channel: ChannelId, address: NetworkAddress);
    /// A queued write finished.
    fn on_data_sent(&self, channel: ChannelId, bytes: Vec<u8>, success: bool);
    /// A complete envelope arrived.
    fn on_data_received(&self, channel: ChannelId, bytes: Vec<u8>);
    /// The connection went away.
    fn on_connection_closed(&self, channel: ChannelId);
    /// The transport released all its resources.
    fn on_destroyed(&self, channel: ChannelId);
}

/// Callback handle a transport holds to report to its owner.
///
/// Holds the owner weakly, so a transport outliving its daemon reports into
/// the void instead of keeping the daemon alive.
#[derive(Clone)]
pub struct DaemonHandle {
    channel: ChannelId,
    events: Weak<dyn TransportEvents>,
}

impl DaemonHandle {
    /// Create a handle reporting `channel` events to `events`.
    pub fn new(channel: ChannelId, events: Weak<dyn TransportEvents>) -> Self {
        Self { channel, events }
    }

    /// Handle for a strongly held receiver.
    pub fn for_events(channel: ChannelId, events: &Arc<dyn TransportEvents>) -> Self {
        Self::new(channel, Arc::downgrade(events))
    }

    /// Get the channel this handle reports for.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    fn with_events(&self, f: impl FnOnce(&dyn TransportEvents)) {
        if let Some(events) = self.events.upgrade() {
            f(events.as_ref());
        }
    }

    /// Report an established connection.
    pub fn connection_established(&self, address: NetworkAddress) {
        self.with_events(|e| e.on_connection_established(self.channel, address));
    }

    /// Report a failed connection.
    pub fn connection_failed(&self, address: NetworkAddress) {
        self.with_events(|e| e.on_connection_failed(self.channel, address));
    }

    /// Report the outcome of a write.
    pub fn data_sent(&self, bytes: Vec<u8>, success: bool) {
        self.with_events(|e| e.on_data_sent(self.channel, bytes, success));
    }

    /// Deliver received envelope bytes.
    pub fn data_received(&self, bytes: Vec<u8>) {
        self.with_events(|e| e.on_data_received(self.channel, bytes));
    }

    /// Report a closed connection.
    pub fn connection_closed(&self) {
        self.with_events(|e| e.on_connection_closed(self.channel));
    }

    /// Report final teardown.
    pub fn destroyed(&self) {
        self.with_events(|e| e.on_destroyed(self.channel));
    }
}

impl fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("channel", &self.channel)
            .field("alive", &(self.events.strong_count() > 0))
            .finish()
    }
}

/// A physical channel able to carry envelopes between two peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel this transport serves.
    fn channel(&self) -> ChannelId;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// True once data can flow.
    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start connecting (client) or listening (server) in the background.
    ///
    /// A transport that has to pick a different local address rewrites the
    /// descriptor's server address.
    fn setup_connection(&self, descriptor: &mut ServiceDescriptor);

    /// Queue framed bytes for writing. Returns whether they were accepted.
    fn send_raw(&self, bytes: Vec<u8>) -> bool;

    /// Start delivering received envelopes. Returns whether reading started.
    fn listen_for_messages(&self) -> bool;

    /// Drop the current connection, keeping the transport reusable.
    async fn stop_current_connection(&self);

    /// Release everything. The transport is unusable afterwards.
    async fn destroy(&self);
}

/// Builds the transport for a channel, if this build has one.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `channel` reporting through `handle`.
    fn create(&self, channel: ChannelId, handle: DaemonHandle) -> Option<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl TransportEvents for Recorder {
        fn on_connection_established(&self, channel: ChannelId, address: NetworkAddress) {
            self.events.lock().push(format!("up {channel} {address}"));
        }
        fn on_connection_failed(&self, channel: ChannelId, _: NetworkAddress) {
            self.events.lock().push(format!("failed {channel}"));
        }
        fn on_data_sent(&self, channel: ChannelId, bytes: Vec<u8>, success: bool) {
            self.events.lock().push(format!("sent {channel} {} {success}", bytes.len()));
        }
        fn on_data_received(&self, channel: ChannelId, bytes: Vec<u8>) {
            self.events.lock().push(format!("recv {channel} {}", bytes.len()));
        }
        fn on_connection_closed(&self, channel: ChannelId) {
            self.events.lock().push(format!("closed {channel}"));
        }
        fn on_destroyed(&self, channel: ChannelId) {
            self.events.lock().push(format!("destroyed {channel}"));
        }
    }

    #[test]
    fn test_handle_forwards_with_channel() {
        let recorder = Arc::new(Recorder::default());
        let events: Arc<dyn TransportEvents> = recorder.clone();
        let handle = DaemonHandle::for_events(ChannelId::Sms, &events);

        handle.data_sent(vec![0; 9], true);
        handle.data_received(vec![0; 5]);
        handle.connection_closed();

        assert_eq!(
            *recorder.events.lock(),
            vec!["sent sms 9 true", "recv sms 5", "closed sms"]
        );
    }

    #[test]
    fn test_handle_outliving_owner_is_silent() {
        let events: Arc<dyn TransportEvents> = Arc::new(Recorder::default());
        let handle = DaemonHandle::for_events(ChannelId::Wifi, &events);
        drop(events);
        handle.destroyed();
        assert_eq!(handle.channel(), ChannelId::Wifi);
        assert!(format!("{handle:?}").contains("alive: false"));
    }
}
