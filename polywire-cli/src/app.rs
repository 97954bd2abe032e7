//! Chat session driver.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use polywire_core::crypto::fingerprint;
use polywire_core::{
    CustomMessage, HandshakeSession, KeyStore, Message, MessageType, NextAction,
};
use polywire_transport::{
    ChannelId, Daemon, EventListener, NetworkAddress, Role, SendOutcome, ServiceDescriptor,
    SessionEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

const CHANNEL: ChannelId = ChannelId::Wifi;

/// Connection settings from the command line.
pub struct SessionOptions {
    pub address: SocketAddr,
    pub server: bool,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub phone: Option<String>,
}

enum Phase {
    Connecting,
    ExchangingKeys,
    Handshaking(Handshake),
    Chatting,
}

/// Handshake progress tied to delivery: a step only advances once the daemon
/// confirms the envelope was written. Peer messages that arrive before that
/// confirmation wait in `early`.
struct Handshake {
    session: HandshakeSession,
    in_flight: Option<MessageType>,
    early: VecDeque<Message>,
}

impl Handshake {
    fn new(session: HandshakeSession) -> Self {
        Self {
            session,
            in_flight: None,
            early: VecDeque::new(),
        }
    }

    fn on_received(&mut self, daemon: &Daemon, message: Message) -> Result<()> {
        self.early.push_back(message);
        self.drive(daemon)
    }

    fn on_sent(&mut self, daemon: &Daemon, msg_type: MessageType) -> Result<()> {
        if self.in_flight != Some(msg_type) {
            return Ok(());
        }
        self.in_flight = None;
        self.session.on_message_sent();
        self.drive(daemon)
    }

    /// The cached message stays in the session, so the next event resends it.
    fn on_failed(&mut self) {
        self.in_flight = None;
    }

    fn drive(&mut self, daemon: &Daemon) -> Result<()> {
        while !self.session.is_complete() {
            match self.session.next_action() {
                NextAction::Send => {
                    if self.in_flight.is_none() {
                        self.send_pending(daemon)?;
                    }
                    break;
                }
                NextAction::Receive => {
                    let Some(message) = self.early.pop_front() else { break };
                    self.session.process_received_message(&message);
                }
            }
        }
        Ok(())
    }

    fn send_pending(&mut self, daemon: &Daemon) -> Result<()> {
        let (Some(msg), Some(msg_type)) = (
            self.session.next_message_to_send(),
            self.session.message_type_for_send(),
        ) else {
            return Ok(());
        };
        if !daemon.send(&msg, msg_type) {
            bail!("handshake message {msg_type} was not sent");
        }
        self.in_flight = Some(msg_type);
        Ok(())
    }
}

pub fn open_store(dir: &Path) -> Result<Arc<KeyStore>> {
    let store = KeyStore::open(dir)?;
    store.ensure_own_keypair()?;
    store.ensure_own_id()?;
    Ok(Arc::new(store))
}

pub fn show_id(store: &KeyStore) -> Result<()> {
    let id = store.ensure_own_id()?;
    println!("id:          {id}");
    println!("fingerprint: {}", fingerprint(&store.own_public_key()?)?);
    if let Some(peer) = store.partner_id() {
        println!("last peer:   {peer}");
    }
    println!("store:       {}", store.dir().display());
    Ok(())
}

pub async fn run(store: Arc<KeyStore>, options: SessionOptions) -> Result<()> {
    let daemon = Daemon::new(store.clone(), vec![CHANNEL]);
    let (listener, mut events) = EventListener::channel();
    daemon.set_listener(Some(listener));
    daemon.select_channel(CHANNEL);

    let role = if options.server { Role::Server } else { Role::Client };
    let mut descriptor = ServiceDescriptor::new(
        Uuid::new_v4(),
        "polywire-chat",
        "two-peer chat",
        NetworkAddress::ip(options.address),
        role,
    )
    .with_ip_timeout(options.timeout_secs)
    .with_ip_max_attempts(options.attempts);

    daemon.establish_connection(&mut descriptor);
    match (role, descriptor.server_address().ip) {
        (Role::Server, Some(bound)) => println!("* listening on {bound}"),
        _ => println!("* connecting to {}", options.address),
    }

    let mut phase = Phase::Connecting;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                match on_event(&daemon, &store, &options, &mut phase, event) {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim() == "/quit" => break Ok(()),
                Ok(Some(line)) => on_input(&daemon, &phase, line),
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow::Error::new(e).context("reading stdin")),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    daemon.teardown().await;
    println!("* session ended");
    result
}

fn on_input(daemon: &Daemon, phase: &Phase, line: String) {
    if line.is_empty() {
        return;
    }
    if !matches!(phase, Phase::Chatting) {
        println!("* not ready yet");
        return;
    }
    let msg = Message::Custom(CustomMessage::text(&line));
    if daemon.send(&msg, MessageType::Symmetric) {
        println!("you: {line}");
    }
}

/// Handle one daemon event. Returns `false` when the session is over.
fn on_event(
    daemon: &Daemon,
    store: &Arc<KeyStore>,
    options: &SessionOptions,
    phase: &mut Phase,
    event: SessionEvent,
) -> Result<bool> {
    match event {
        SessionEvent::ConnectionEstablished { channel, address } => {
            println!("* connected to {address}");
            if !daemon.listen(channel) {
                bail!("could not start reading on {channel}");
            }
            let own = store.own_exchange_message(options.phone.as_deref(), None)?;
            if !daemon.send(&Message::PublicKeyExchange(own), MessageType::PublicKeyExchange) {
                bail!("could not announce public key");
            }
            *phase = Phase::ExchangingKeys;
        }
        SessionEvent::ConnectionFailed { address, .. } => {
            bail!("could not reach {address}");
        }
        SessionEvent::ConnectionClosed(_) => {
            println!("* peer disconnected");
            return Ok(false);
        }
        SessionEvent::MessageSent(SendOutcome::Failed { error, .. }) => {
            if let Phase::Handshaking(handshake) = phase {
                handshake.on_failed();
            }
            println!("* send failed: {error}");
        }
        SessionEvent::MessageSent(SendOutcome::Sent { msg_type, length, .. }) => {
            debug!(%msg_type, length, "sent");
            if let Phase::Handshaking(handshake) = phase {
                handshake.on_sent(daemon, msg_type)?;
                finish_handshake(phase);
            }
        }
        SessionEvent::MessageReceived {
            msg_type, message, ..
        } => on_message(daemon, store, phase, msg_type, message)?,
        SessionEvent::ChannelDestroyed(_) => return Ok(false),
    }
    Ok(true)
}

fn on_message(
    daemon: &Daemon,
    store: &Arc<KeyStore>,
    phase: &mut Phase,
    msg_type: MessageType,
    message: Message,
) -> Result<()> {
    if let Message::PublicKeyExchange(exchange) = &message {
        store.import_peer_exchange(exchange)?;
        println!(
            "* peer {} (fingerprint {})",
            exchange.owner(),
            fingerprint(exchange.public_key())?
        );
        let own = store.ensure_own_id()?;
        let session = HandshakeSession::for_peers(own, exchange.owner(), store.clone());
        let mut handshake = Handshake::new(session);
        handshake.drive(daemon)?;
        *phase = Phase::Handshaking(handshake);
        return Ok(());
    }

    match phase {
        Phase::Handshaking(handshake) => {
            handshake.on_received(daemon, message)?;
            finish_handshake(phase);
        }
        Phase::Chatting if msg_type == MessageType::Symmetric => match &message {
            Message::Custom(custom) => match custom.as_str() {
                Ok(text) => println!("peer: {text}"),
                Err(_) => println!("peer: <{} bytes>", custom.as_bytes().len()),
            },
            other => debug!(kind = other.kind(), "unexpected symmetric payload"),
        },
        _ => debug!(%msg_type, kind = message.kind(), "ignoring message"),
    }
    Ok(())
}

fn finish_handshake(phase: &mut Phase) {
    let Phase::Handshaking(handshake) = phase else { return };
    if !handshake.session.is_complete() {
        return;
    }
    info!(peer = %handshake.session.peer_id(), "session key in place");
    println!("* secure session ready, type to chat, /quit to leave");
    *phase = Phase::Chatting;
}
