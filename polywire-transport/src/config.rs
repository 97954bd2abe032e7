//! Connection configuration.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default per-attempt timeout for short-range radio, seconds.
pub const DEFAULT_BLUETOOTH_TIMEOUT_SECS: u64 = 300;

/// Default per-attempt timeout for IP channels, seconds.
pub const DEFAULT_IP_TIMEOUT_SECS: u64 = 60;

/// Default connection attempts per channel.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Side of the connection this peer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Connects to the server address.
    Client,
    /// Listens on the server address.
    Server,
}

/// Physical channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    /// Near-field tag exchange.
    Nfc,
    /// Short-range radio socket.
    Bluetooth,
    /// Optically scanned codes.
    Barcodes,
    /// Local network.
    Wifi,
    /// Cellular data.
    MobileInternet,
    /// Cellular text messaging.
    Sms,
    /// Any channel.
    Arbitrary,
}

impl ChannelId {
    /// All channel identifiers.
    pub const ALL: [ChannelId; 7] = [
        Self::Nfc,
        Self::Bluetooth,
        Self::Barcodes,
        Self::Wifi,
        Self::MobileInternet,
        Self::Sms,
        Self::Arbitrary,
    ];

    /// Logical channel: wifi and cellular data share one IP transport.
    pub fn logical(self) -> Self {
        match self {
            Self::MobileInternet => Self::Wifi,
            other => other,
        }
    }

    /// True for the IP-based channels.
    pub fn is_ip(self) -> bool {
        self.logical() == Self::Wifi
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Nfc => "nfc",
            Self::Bluetooth => "bluetooth",
            Self::Barcodes => "barcodes",
            Self::Wifi => "wifi",
            Self::MobileInternet => "mobile-internet",
            Self::Sms => "sms",
            Self::Arbitrary => "arbitrary",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}

/// Where a peer can be reached, per medium. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Identity of the device behind the address.
    pub device_id: Option<Uuid>,
    /// IP socket address.
    pub ip: Option<SocketAddr>,
    /// Short-range radio hardware address.
    pub bluetooth: Option<[u8; 6]>,
    /// Phone number for text messaging.
    pub sms: Option<String>,
}

impl NetworkAddress {
    /// Address reachable over IP.
    pub fn ip(addr: SocketAddr) -> Self {
        Self {
            ip: Some(addr),
            ..Self::default()
        }
    }

    /// Parse a radio address written as `AA:BB:CC:DD:EE:FF`.
    pub fn parse_bluetooth(text: &str) -> Option<[u8; 6]> {
        let mut out = [0u8; 6];
        let mut parts = text.split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(out)
    }

    /// Render the radio address as `AA:BB:CC:DD:EE:FF`.
    pub fn bluetooth_string(&self) -> Option<String> {
        self.bluetooth.map(|b| {
            format!(
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            )
        })
    }

    /// True when ip, radio address or phone number match, treating two
    /// absent values as equal.
    ///
    /// Because of that, two ip-only addresses with different ips still count
    /// as the same address: both lack a radio address. Compare `ip` directly
    /// when only the socket address matters.
    pub fn shares_same_address(&self, other: &NetworkAddress) -> bool {
        self.ip == other.ip || self.bluetooth == other.bluetooth || self.sms == other.sms
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ip) = self.ip {
            parts.push(format!("ip={ip}"));
        }
        if let Some(bt) = self.bluetooth_string() {
            parts.push(format!("bluetooth={bt}"));
        }
        if let Some(sms) = &self.sms {
            parts.push(format!("sms={sms}"));
        }
        if parts.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

/// Describes the service two peers meet on.
///
/// Created once per session before connection setup. Only
/// [`ServiceDescriptor::set_server_address`] changes it afterwards, used by a
/// transport that had to rebind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    uuid: Uuid,
    name: String,
    description: String,
    server_address: NetworkAddress,
    role: Role,
    use_discovery: bool,
    bluetooth_timeout_secs: u64,
    ip_timeout_secs: u64,
    bluetooth_max_attempts: u32,
    ip_max_attempts: u32,
}

impl ServiceDescriptor {
    /// Create a descriptor with default timeouts and attempt counts.
    pub fn new(
        uuid: Uuid,
        name: impl Into<String>,
        description: impl Into<String>,
        mut server_address: NetworkAddress,
        role: Role,
    ) -> Self {
        server_address.device_id = Some(uuid);
        Self {
            uuid,
            name: name.into(),
            description: description.into(),
            server_address,
            role,
            use_discovery: false,
            bluetooth_timeout_secs: DEFAULT_BLUETOOTH_TIMEOUT_SECS,
            ip_timeout_secs: DEFAULT_IP_TIMEOUT_SECS,
            bluetooth_max_attempts: DEFAULT_MAX_ATTEMPTS,
            ip_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Per-attempt timeout for IP channels. `0` waits indefinitely.
    pub fn with_ip_timeout(mut self, secs: u64) -> Self {
        self.ip_timeout_secs = secs;
        self
    }

    /// Connection attempts for IP channels.
    pub fn with_ip_max_attempts(mut self, attempts: u32) -> Self {
        self.ip_max_attempts = attempts;
        self
    }

    /// Per-attempt timeout for short-range radio. `0` waits indefinitely.
    pub fn with_bluetooth_timeout(mut self, secs: u64) -> Self {
        self.bluetooth_timeout_secs = secs;
        self
    }

    /// Connection attempts for short-range radio.
    pub fn with_bluetooth_max_attempts(mut self, attempts: u32) -> Self {
        self.bluetooth_max_attempts = attempts;
        self
    }

    /// Find the peer through service discovery instead of a fixed address.
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.use_discovery = enabled;
        self
    }

    /// Service id.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Address of the serving peer.
    pub fn server_address(&self) -> &NetworkAddress {
        &self.server_address
    }

    /// Rewrite the server address after a rebind.
    pub fn set_server_address(&mut self, address: NetworkAddress) {
        self.server_address = address;
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether discovery is requested.
    pub fn use_discovery(&self) -> bool {
        self.use_discovery
    }

    /// Per-attempt timeout for a channel, in seconds.
    pub fn timeout_secs(&self, channel: ChannelId) -> u64 {
        match channel.logical() {
            ChannelId::Bluetooth => self.bluetooth_timeout_secs,
            _ => self.ip_timeout_secs,
        }
    }

    /// Connection attempts for a channel.
    pub fn max_attempts(&self, channel: ChannelId) -> u32 {
        match channel.logical() {
            ChannelId::Bluetooth => self.bluetooth_max_attempts,
            _ => self.ip_max_attempts,
        }
    }
}
