//! IP transport over TCP.
//!
//! The server side binds its listener synchronously inside
//! `setup_connection`, rebinding to an ephemeral port when the requested one
//! is taken, and accepts in the background. The client side connects in the
//! background. Both use the shared retry loop.
//!
//! Once connected, every send spawns its own write task. Each write task waits
//! for the one spawned before it, so envelopes hit the socket in the order
//! they were sent even though the runtime may schedule the tasks in any
//! order. The read loop starts on `listen_for_messages`. An oversized
//! envelope is skipped and reading goes on; a stream that ends mid-envelope or
//! fails with an I/O error closes the connection.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use polywire_core::ProtocolError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{ChannelId, NetworkAddress, Role, ServiceDescriptor};
use crate::error::TransportError;
use crate::retry::{connect_with_retry, RetryPolicy};
use crate::stream::{read_envelope, write_envelope};
use crate::tasks::{TaskRegistry, JOIN_TIMEOUT};
use crate::transport::{ConnectionState, DaemonHandle, Transport};

struct Link {
    state: ConnectionState,
    reader: Option<OwnedReadHalf>,
    writer: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    // Completion signal of the most recently spawned write.
    last_write: Option<oneshot::Receiver<()>>,
    remote: Option<SocketAddr>,
}

impl Link {
    fn idle() -> Self {
        Self {
            state: ConnectionState::None,
            reader: None,
            writer: None,
            last_write: None,
            remote: None,
        }
    }
}

/// TCP transport serving the wifi and mobile-internet channels.
pub struct IpTransport {
    channel: ChannelId,
    handle: DaemonHandle,
    link: Arc<Mutex<Link>>,
    tasks: Mutex<Arc<TaskRegistry>>,
    destroyed: AtomicBool,
}

impl IpTransport {
    /// Create an idle transport reporting through `handle`.
    pub fn new(handle: DaemonHandle) -> Self {
        Self {
            channel: handle.channel(),
            handle,
            link: Arc::new(Mutex::new(Link::idle())),
            tasks: Mutex::new(Arc::new(TaskRegistry::new())),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Address of the connected peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.lock().remote
    }

    fn registry(&self) -> Arc<TaskRegistry> {
        self.tasks.lock().clone()
    }

    fn start_server(&self, descriptor: &mut ServiceDescriptor) -> Result<(), TransportError> {
        let requested = descriptor
            .server_address()
            .ip
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let std_listener = bind_or_rebind(requested)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;
        if local != requested {
            info!(%requested, %local, "listening on a different address");
            let mut address = descriptor.server_address().clone();
            address.ip = Some(local);
            descriptor.set_server_address(address);
        }
        let listener = Arc::new(TcpListener::from_std(std_listener)?);

        self.link.lock().state = ConnectionState::Listening;
        info!(channel = %self.channel, %local, "waiting for peer");

        let policy = RetryPolicy::new(
            descriptor.max_attempts(self.channel),
            descriptor.timeout_secs(self.channel),
        );
        let address = descriptor.server_address().clone();
        self.spawn_connect(policy, address, move |_| {
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        Ok(())
    }

    fn start_client(&self, descriptor: &ServiceDescriptor) -> Result<(), TransportError> {
        let target = descriptor
            .server_address()
            .ip
            .ok_or(TransportError::NoAddress(self.channel))?;

        self.link.lock().state = ConnectionState::Connecting;
        info!(channel = %self.channel, %target, "connecting");

        let policy = RetryPolicy::new(
            descriptor.max_attempts(self.channel),
            descriptor.timeout_secs(self.channel),
        );
        let address = descriptor.server_address().clone();
        self.spawn_connect(policy, address, move |_| async move {
            let stream = TcpStream::connect(target).await?;
            let peer = stream.peer_addr()?;
            Ok((stream, peer))
        });
        Ok(())
    }

    fn spawn_connect<F, Fut>(&self, policy: RetryPolicy, address: NetworkAddress, attempt: F)
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send + 'static,
    {
        let registry = self.registry();
        let token = registry.cancellation();
        let link = self.link.clone();
        let handle = self.handle.clone();

        registry.spawn_cancellable(async move {
            match connect_with_retry(&policy, &address, &token, attempt).await {
                Ok((stream, peer)) => {
                    on_connected(&link, &handle, stream, peer);
                }
                Err(TransportError::Cancelled) => {
                    debug!("connection attempt cancelled");
                }
                Err(e) => {
                    warn!(error = %e, "giving up on connection");
                    link.lock().state = ConnectionState::None;
                    handle.connection_failed(address);
                }
            }
        });
    }
}

fn bind_or_rebind(requested: SocketAddr) -> std::io::Result<StdTcpListener> {
    match StdTcpListener::bind(requested) {
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && requested.port() != 0 => {
            warn!(%requested, "address in use, rebinding to an ephemeral port");
            StdTcpListener::bind(SocketAddr::new(requested.ip(), 0))
        }
        other => other,
    }
}

fn on_connected(link: &Arc<Mutex<Link>>, handle: &DaemonHandle, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable nagle");
    }
    let (reader, writer) = stream.into_split();
    {
        let mut link = link.lock();
        link.state = ConnectionState::Connected;
        link.reader = Some(reader);
        link.writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
        link.last_write = None;
        link.remote = Some(peer);
    }
    handle.connection_established(NetworkAddress::ip(peer));
}

#[async_trait]
impl Transport for IpTransport {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    fn setup_connection(&self, descriptor: &mut ServiceDescriptor) {
        if self.destroyed.load(Ordering::SeqCst) {
            warn!(channel = %self.channel, "setup on destroyed transport");
            return;
        }
        if self.state() != ConnectionState::None {
            debug!(channel = %self.channel, state = %self.state(), "connection already in progress");
            return;
        }

        let started = match descriptor.role() {
            Role::Server => self.start_server(descriptor),
            Role::Client => self.start_client(descriptor),
        };
        if let Err(e) = started {
            warn!(channel = %self.channel, error = %e, "connection setup failed");
            self.link.lock().state = ConnectionState::None;
            self.handle
                .connection_failed(descriptor.server_address().clone());
        }
    }

    fn send_raw(&self, bytes: Vec<u8>) -> bool {
        let (writer, previous, done) = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connected {
                return false;
            }
            let Some(writer) = link.writer.clone() else {
                return false;
            };
            let (done, next) = oneshot::channel();
            (writer, link.last_write.replace(next), done)
        };

        let handle = self.handle.clone();
        self.registry().spawn_cancellable(async move {
            if let Some(previous) = previous {
                // Err: the previous write was cancelled before finishing.
                let _ = previous.await;
            }
            let ok = {
                let mut writer = writer.lock().await;
                match write_envelope(&mut *writer, &bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        false
                    }
                }
            };
            handle.data_sent(bytes, ok);
            let _ = done.send(());
        });
        true
    }

    fn listen_for_messages(&self) -> bool {
        let mut reader = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connected {
                return false;
            }
            match link.reader.take() {
                Some(reader) => reader,
                None => return false,
            }
        };

        let link = self.link.clone();
        let handle = self.handle.clone();
        self.registry().spawn_cancellable(async move {
            loop {
                match read_envelope(&mut reader).await {
                    Ok(Some(bytes)) => handle.data_received(bytes),
                    Ok(None) => {
                        debug!("peer closed the stream");
                        break;
                    }
                    Err(TransportError::Protocol(ProtocolError::PayloadTooLarge { length, .. })) => {
                        warn!(length, "dropped oversized envelope");
                    }
                    Err(e) => {
                        warn!(error = %e, "read failed, closing connection");
                        break;
                    }
                }
            }
            *link.lock() = Link::idle();
            handle.connection_closed();
        });
        true
    }

    async fn stop_current_connection(&self) {
        let registry = std::mem::replace(&mut *self.tasks.lock(), Arc::new(TaskRegistry::new()));
        registry.shutdown(JOIN_TIMEOUT).await;

        let was_active = {
            let mut link = self.link.lock();
            let active = link.state != ConnectionState::None;
            *link = Link::idle();
            active
        };
        if was_active {
            info!(channel = %self.channel, "connection stopped");
            self.handle.connection_closed();
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_current_connection().await;
        self.handle.destroyed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvents;
    use polywire_core::{Envelope, MessageType};
    use tokio::sync::mpsc::{self, UnboundedSender};
    use uuid::Uuid;

    #[derive(Debug)]
    enum Event {
        Up(ChannelId),
        Failed(NetworkAddress),
        Sent(bool),
        Received(Vec<u8>),
        Closed,
        Destroyed,
    }

    struct Forward(UnboundedSender<Event>);

    impl TransportEvents for Forward {
        fn on_connection_established(&self, channel: ChannelId, _: NetworkAddress) {
            let _ = self.0.send(Event::Up(channel));
        }
        fn on_connection_failed(&self, _: ChannelId, address: NetworkAddress) {
            let _ = self.0.send(Event::Failed(address));
        }
        fn on_data_sent(&self, _: ChannelId, _: Vec<u8>, success: bool) {
            let _ = self.0.send(Event::Sent(success));
        }
        fn on_data_received(&self, _: ChannelId, bytes: Vec<u8>) {
            let _ = self.0.send(Event::Received(bytes));
        }
        fn on_connection_closed(&self, _: ChannelId) {
            let _ = self.0.send(Event::Closed);
        }
        fn on_destroyed(&self, _: ChannelId) {
            let _ = self.0.send(Event::Destroyed);
        }
    }

    fn transport() -> (IpTransport, Arc<dyn TransportEvents>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events: Arc<dyn TransportEvents> = Arc::new(Forward(tx));
        let t = IpTransport::new(DaemonHandle::for_events(ChannelId::Wifi, &events));
        (t, events, rx)
    }

    fn descriptor(addr: SocketAddr, role: Role) -> ServiceDescriptor {
        ServiceDescriptor::new(Uuid::new_v4(), "test", "", NetworkAddress::ip(addr), role)
            .with_ip_timeout(5)
            .with_ip_max_attempts(1)
    }

    #[tokio::test]
    async fn test_rebinds_when_port_taken() {
        let squatter = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let taken = squatter.local_addr().unwrap();

        let (server, _events, _rx) = transport();
        let mut desc = descriptor(taken, Role::Server);
        server.setup_connection(&mut desc);

        let rebound = desc.server_address().ip.unwrap();
        assert_ne!(rebound.port(), taken.port());
        assert_eq!(server.state(), ConnectionState::Listening);
        server.destroy().await;
    }

    #[tokio::test]
    async fn test_client_and_server_exchange_in_order() {
        let (server, _se, mut server_rx) = transport();
        let (client, _ce, mut client_rx) = transport();

        let mut desc = descriptor("127.0.0.1:0".parse().unwrap(), Role::Server);
        server.setup_connection(&mut desc);
        let mut client_desc = descriptor(desc.server_address().ip.unwrap(), Role::Client);
        client.setup_connection(&mut client_desc);

        assert!(matches!(server_rx.recv().await, Some(Event::Up(ChannelId::Wifi))));
        assert!(matches!(client_rx.recv().await, Some(Event::Up(ChannelId::Wifi))));
        assert!(server.listen_for_messages());
        assert!(!server.listen_for_messages());

        for i in 0..5u8 {
            let raw = Envelope::new(MessageType::Plain, vec![i; 10]).unwrap().to_wire();
            assert!(client.send_raw(raw));
        }
        for i in 0..5u8 {
            match server_rx.recv().await {
                Some(Event::Received(bytes)) => {
                    assert_eq!(Envelope::decode(&bytes).unwrap().ciphertext(), &[i; 10]);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        for _ in 0..5 {
            assert!(matches!(client_rx.recv().await, Some(Event::Sent(true))));
        }

        client.destroy().await;
        assert!(matches!(client_rx.recv().await, Some(Event::Closed)));
        assert!(matches!(client_rx.recv().await, Some(Event::Destroyed)));
        assert!(matches!(server_rx.recv().await, Some(Event::Closed)));
        assert_eq!(server.state(), ConnectionState::None);
        assert!(!client.send_raw(vec![0; 5]));
    }

    #[tokio::test]
    async fn test_client_without_address_fails() {
        let (client, _events, mut rx) = transport();
        let mut desc = ServiceDescriptor::new(
            Uuid::new_v4(),
            "test",
            "",
            NetworkAddress::default(),
            Role::Client,
        );
        client.setup_connection(&mut desc);
        assert!(matches!(rx.recv().await, Some(Event::Failed(_))));
        assert_eq!(client.state(), ConnectionState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_server_reports_failure() {
        let (server, _events, mut rx) = transport();
        let mut desc = descriptor("127.0.0.1:0".parse().unwrap(), Role::Server)
            .with_ip_timeout(1)
            .with_ip_max_attempts(2);
        server.setup_connection(&mut desc);
        let expected = desc.server_address().clone();

        match rx.recv().await {
            Some(Event::Failed(address)) => assert_eq!(address, expected),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.state(), ConnectionState::None);
    }
}
