//! Transport errors.
//!
//! None of these cross the daemon boundary as a failure of the caller.
//! The daemon turns them into listener callbacks and drops the affected message.

use polywire_core::ProtocolError;
use thiserror::Error;

use crate::config::{ChannelId, NetworkAddress};

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    // --- Connection & Setup ---
    /// All connection attempts to an address failed.
    #[error("connection to {0} failed")]
    ConnectionFailed(NetworkAddress),
    /// The connection attempt was cancelled by teardown.
    #[error("connection attempt cancelled")]
    Cancelled,
    /// The descriptor carries no address usable by this transport.
    #[error("no usable address for {0}")]
    NoAddress(ChannelId),

    // --- Sending ---
    /// Send requested without a selected channel.
    #[error("no channel selected")]
    NoChannelSelected,
    /// The channel is unknown, torn down or not connected.
    #[error("channel {0} not ready")]
    ChannelNotReady(ChannelId),
    /// The transport accepted the bytes but the write failed.
    #[error("write on {0} failed")]
    WriteFailed(ChannelId),

    // --- Lower layers ---
    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing, integrity or crypto failure from polywire-core.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_converts() {
        let err: TransportError = ProtocolError::MalformedEnvelope.into();
        assert!(matches!(err, TransportError::Protocol(ProtocolError::MalformedEnvelope)));
        assert_eq!(
            TransportError::ChannelNotReady(ChannelId::Sms).to_string(),
            "channel sms not ready"
        );
    }
}
