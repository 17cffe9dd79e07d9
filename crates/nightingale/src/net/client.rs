use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::config::ClientConfig;
use super::connection::ConnectionState;
use super::protocol::{ANONYMOUS_CONNECTION_ID, MessageType, Packet};
use super::stats::NetworkStats;
use super::tracking::DeliveryLedger;
use super::transport::{SendError, Transport};
use super::worker::{StopSignal, Worker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    TimedOut,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused => f.write_str("Connection refused by server."),
            Self::TimedOut => f.write_str("Connect request timed out."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    RequestedByClient,
    TimedOut,
    /// The server's stated reason, if it gave one.
    ForcedByServer(Option<String>),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestedByClient => f.write_str("Disconnect requested by client."),
            Self::TimedOut => f.write_str("Connection timed out."),
            Self::ForcedByServer(Some(reason)) => f.write_str(reason),
            Self::ForcedByServer(None) => f.write_str("Disconnected by server."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    CouldNotConnect(ConnectFailure),
    Disconnected(DisconnectReason),
    Received(String),
    /// An application message the server reports it never got. `resend_of`
    /// is the id of the first transmission, for chained resends.
    MessageNotDelivered {
        message_id: u32,
        resend_of: u32,
        message: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve server address {0}")]
    ServerNotFound(String),
    #[error("could not open socket: {0}")]
    CouldNotOpenSocket(#[source] io::Error),
    #[error("could not send connect request: {0}")]
    CouldNotSendConnectRequest(#[source] SendError),
}

struct ClientInner {
    state: ConnectionState,
    server_addr: Option<SocketAddr>,
    connection_id: u32,
    transport: Option<Arc<Transport>>,
    ledger: DeliveryLedger,
    latency: Option<Duration>,
    /// When the timeout watcher gives up on the server.
    deadline: Instant,
    /// Bumped on every teardown so workers from an earlier attempt go quiet.
    epoch: u64,
    receiver: Option<Worker>,
    watcher: Option<Worker>,
    pinger: Option<Worker>,
}

impl ClientInner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            server_addr: None,
            connection_id: ANONYMOUS_CONNECTION_ID,
            transport: None,
            ledger: DeliveryLedger::new(),
            latency: None,
            deadline: Instant::now(),
            epoch: 0,
            receiver: None,
            watcher: None,
            pinger: None,
        }
    }

    fn send_stamped(&mut self, packet: Packet) -> Result<u32, SendError> {
        let (Some(transport), Some(addr)) = (self.transport.as_ref(), self.server_addr) else {
            return Err(SendError::NotConnected);
        };
        transport.send_stamped(&mut self.ledger, packet, addr)
    }

    fn send_application(&mut self, mut packet: Packet, duplicate_of: u32) -> Result<u32, SendError> {
        if self.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        packet.header.duplicate_of = duplicate_of;
        self.send_stamped(packet)
    }

    /// Stops every worker, closes the socket and forgets the server.
    fn teardown(&mut self) {
        for worker in [self.receiver.take(), self.watcher.take(), self.pinger.take()]
            .into_iter()
            .flatten()
        {
            worker.stop();
        }

        self.state = ConnectionState::Idle;
        self.server_addr = None;
        self.connection_id = ANONYMOUS_CONNECTION_ID;
        self.transport = None;
        self.ledger.reset();
        self.latency = None;
        self.epoch += 1;
    }

    fn update_latency(&mut self, sample: Duration) {
        self.latency = Some(match self.latency {
            Some(current) => (current + sample) / 2,
            None => sample,
        });
    }
}

struct ClientShared {
    config: ClientConfig,
    events: Sender<ClientEvent>,
    inner: Mutex<ClientInner>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state == ConnectionState::Connected {
            let packet = Packet::client_disconnect(inner.connection_id);
            let _ = inner.send_stamped(packet);
        }
        inner.teardown();
    }
}

/// One client's connection to a server.
///
/// Cloning yields another handle to the same connection. Events are
/// delivered on the receiver returned by [`ClientConnection::new`]; they are
/// always sent after internal locks are released.
#[derive(Clone)]
pub struct ClientConnection {
    shared: Arc<ClientShared>,
}

impl ClientConnection {
    pub fn new(config: ClientConfig) -> (Self, Receiver<ClientEvent>) {
        let (events, receiver) = mpsc::channel();
        let shared = Arc::new(ClientShared {
            config,
            events,
            inner: Mutex::new(ClientInner::new()),
        });
        (Self { shared }, receiver)
    }

    /// Resolves `server` ("host:port") and starts connecting to it.
    pub fn connect(&self, server: &str) -> Result<(), ConnectError> {
        let addr = server
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConnectError::ServerNotFound(server.to_owned()))?;
        self.connect_to(addr)
    }

    /// Starts connecting to `addr`. The outcome arrives later as
    /// [`ClientEvent::Connected`] or [`ClientEvent::CouldNotConnect`].
    ///
    /// An existing connection is closed first; an attempt in progress is
    /// abandoned.
    pub fn connect_to(&self, addr: SocketAddr) -> Result<(), ConnectError> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.shared.lock();
            let state = inner.state;
            match state {
                ConnectionState::Connected => {
                    let packet = Packet::client_disconnect(inner.connection_id);
                    let _ = inner.send_stamped(packet);
                    inner.teardown();
                    events.push(ClientEvent::Disconnected(DisconnectReason::RequestedByClient));
                }
                ConnectionState::Connecting => inner.teardown(),
                ConnectionState::Idle => {}
            }

            let result = self.shared.begin_connect(&mut inner, addr);
            if result.is_err() {
                inner.teardown();
            }
            result
        };

        self.shared.emit_all(events);
        result
    }

    /// Closes the connection, telling the server on a best-effort basis.
    /// A connect attempt in progress is abandoned without an event.
    pub fn disconnect(&self) {
        let disconnected = {
            let mut inner = self.shared.lock();
            let state = inner.state;
            match state {
                ConnectionState::Connected => {
                    let packet = Packet::client_disconnect(inner.connection_id);
                    if let Err(e) = inner.send_stamped(packet) {
                        log::debug!("Could not notify server of disconnect: {}", e);
                    }
                    inner.teardown();
                    true
                }
                ConnectionState::Connecting => {
                    log::debug!("Abandoning connect request");
                    inner.teardown();
                    false
                }
                ConnectionState::Idle => false,
            }
        };

        if disconnected {
            log::info!("Disconnected from server");
            self.shared
                .emit(ClientEvent::Disconnected(DisconnectReason::RequestedByClient));
        }
    }

    /// Sends an application message and returns its message id.
    pub fn send(&self, message: &str) -> Result<u32, SendError> {
        let mut inner = self.shared.lock();
        let packet = Packet::application(inner.connection_id, message);
        inner.send_application(packet, 0)
    }

    /// Sends `message` again as a duplicate of `original_message_id`, so the
    /// server processes it at most once.
    pub fn resend(&self, original_message_id: u32, message: &str) -> Result<u32, SendError> {
        let mut inner = self.shared.lock();
        let packet = Packet::application(inner.connection_id, message);
        inner.send_application(packet, original_message_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn connection_id(&self) -> Option<u32> {
        let inner = self.shared.lock();
        (inner.state == ConnectionState::Connected).then_some(inner.connection_id)
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().transport.as_ref().map(|t| t.local_addr())
    }

    /// Round trip estimate from pings, `None` until the first response.
    pub fn latency(&self) -> Option<Duration> {
        self.shared.lock().latency
    }

    pub fn stats(&self) -> NetworkStats {
        self.shared
            .lock()
            .transport
            .as_ref()
            .map(|t| t.stats())
            .unwrap_or_default()
    }
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // The application may have dropped its receiver; nothing to do then.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ClientEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn begin_connect(
        self: &Arc<Self>,
        inner: &mut ClientInner,
        addr: SocketAddr,
    ) -> Result<(), ConnectError> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let transport = Transport::bind(bind_addr, self.config.packet_loss.clone())
            .map(Arc::new)
            .map_err(ConnectError::CouldNotOpenSocket)?;

        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.state = ConnectionState::Connecting;
        inner.server_addr = Some(addr);
        inner.deadline = Instant::now() + self.config.connect_timeout;
        inner.transport = Some(Arc::clone(&transport));

        log::info!("Connecting to {} from {}", addr, transport.local_addr());

        let weak = Arc::downgrade(self);
        let receiver = transport
            .spawn_receiver("nightingale-client-recv", move |packet, from| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_packet(epoch, packet, from);
                }
            })
            .map_err(ConnectError::CouldNotOpenSocket)?;
        inner.receiver = Some(receiver);

        let weak = Arc::downgrade(self);
        let watcher = Worker::spawn("nightingale-client-timeout", move |signal| {
            watch_timeout(weak, epoch, signal)
        })
        .map_err(ConnectError::CouldNotOpenSocket)?;
        inner.watcher = Some(watcher);

        inner
            .send_stamped(Packet::connect_request())
            .map_err(ConnectError::CouldNotSendConnectRequest)?;

        Ok(())
    }

    fn handle_packet(self: &Arc<Self>, epoch: u64, packet: Packet, from: SocketAddr) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.state == ConnectionState::Idle {
                log::trace!("Ignoring packet while not connected: {}", packet);
                return;
            }
            if inner.server_addr != Some(from) {
                log::trace!("Ignoring packet from {} which is not the server", from);
                return;
            }

            if inner.ledger.has_seen(&packet) {
                log::trace!("Ignoring already received packet {}", packet.sequence());
            } else if packet.is_duplicate() && inner.ledger.has_seen_duplicate_of(&packet) {
                log::trace!(
                    "Ignoring resend of already received packet {}",
                    packet.header.duplicate_of
                );
                inner.ledger.record_incoming(&packet);
            } else {
                inner.ledger.record_incoming(&packet);
                let state = inner.state;
                match state {
                    ConnectionState::Connecting => {
                        self.handle_connecting(&mut inner, &packet, &mut events)
                    }
                    ConnectionState::Connected => {
                        self.handle_connected(&mut inner, &packet, &mut events)
                    }
                    ConnectionState::Idle => {}
                }
            }

            // Whatever happened above, the packet's ack still tells us what
            // the server missed. A teardown above has already reset the
            // ledger, making this a no-op.
            for undelivered in inner.ledger.check_delivery() {
                if undelivered.message_type() == MessageType::Application {
                    events.push(ClientEvent::MessageNotDelivered {
                        message_id: undelivered.sequence(),
                        resend_of: undelivered.resend_of(),
                        message: undelivered.payload,
                    });
                }
            }
        }

        self.emit_all(events);
    }

    fn handle_connecting(
        self: &Arc<Self>,
        inner: &mut ClientInner,
        packet: &Packet,
        events: &mut Vec<ClientEvent>,
    ) {
        match packet.message_type() {
            MessageType::ConnectionAccepted => {
                inner.state = ConnectionState::Connected;
                inner.connection_id = packet.header.connection_id;
                inner.deadline = Instant::now() + self.config.connection_timeout;

                let weak = Arc::downgrade(self);
                let epoch = inner.epoch;
                let interval = self.config.ping_interval;
                match Worker::spawn("nightingale-client-ping", move |signal| {
                    ping_loop(weak, epoch, interval, signal)
                }) {
                    Ok(worker) => inner.pinger = Some(worker),
                    Err(e) => log::warn!("Could not start ping worker: {}", e),
                }

                log::info!("Connected to server as client {}", inner.connection_id);
                events.push(ClientEvent::Connected);
            }
            MessageType::ConnectionRefused => {
                log::debug!("Connection refused by server");
                inner.teardown();
                events.push(ClientEvent::CouldNotConnect(ConnectFailure::Refused));
            }
            other => log::trace!("Ignoring {:?} while connecting", other),
        }
    }

    fn handle_connected(
        &self,
        inner: &mut ClientInner,
        packet: &Packet,
        events: &mut Vec<ClientEvent>,
    ) {
        match packet.message_type() {
            MessageType::Application => {
                inner.deadline = Instant::now() + self.config.connection_timeout;
                events.push(ClientEvent::Received(
                    packet.payload.clone().unwrap_or_default(),
                ));
            }
            MessageType::PingResponse => {
                inner.deadline = Instant::now() + self.config.connection_timeout;
                let sample = inner
                    .ledger
                    .sent_receipt(packet.header.ack)
                    .filter(|receipt| receipt.packet.message_type() == MessageType::Ping)
                    .map(|receipt| receipt.time.elapsed());
                if let Some(sample) = sample {
                    inner.update_latency(sample);
                    log::trace!("Ping sample {:?}, latency now {:?}", sample, inner.latency);
                }
            }
            MessageType::ForceDisconnect => {
                log::info!(
                    "Disconnected by server: {}",
                    packet.payload.as_deref().unwrap_or("no reason given")
                );
                inner.teardown();
                events.push(ClientEvent::Disconnected(DisconnectReason::ForcedByServer(
                    packet.payload.clone(),
                )));
            }
            other => log::trace!("Ignoring {:?} while connected", other),
        }
    }

    fn handle_timeout(&self, epoch: u64) {
        let event = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            let state = inner.state;
            let event = match state {
                ConnectionState::Connecting => {
                    log::debug!("Connect request timed out");
                    ClientEvent::CouldNotConnect(ConnectFailure::TimedOut)
                }
                ConnectionState::Connected => {
                    log::info!("Connection to server timed out");
                    let packet = Packet::client_disconnect(inner.connection_id);
                    if let Err(e) = inner.send_stamped(packet) {
                        log::debug!("Could not notify server of disconnect: {}", e);
                    }
                    ClientEvent::Disconnected(DisconnectReason::TimedOut)
                }
                ConnectionState::Idle => return,
            };
            inner.teardown();
            event
        };

        self.emit(event);
    }
}

fn watch_timeout(shared: Weak<ClientShared>, epoch: u64, signal: StopSignal) {
    loop {
        let remaining = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let inner = shared.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.deadline.saturating_duration_since(Instant::now())
        };

        if remaining.is_zero() {
            if let Some(shared) = shared.upgrade() {
                shared.handle_timeout(epoch);
            }
            return;
        }
        if !signal.sleep(remaining) {
            return;
        }
    }
}

fn ping_loop(shared: Weak<ClientShared>, epoch: u64, interval: Duration, signal: StopSignal) {
    let mut next_ping = Instant::now();
    loop {
        {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut inner = shared.lock();
            if inner.epoch != epoch || inner.state != ConnectionState::Connected {
                return;
            }
            let packet = Packet::ping(inner.connection_id, inner.latency);
            if let Err(e) = inner.send_stamped(packet) {
                log::debug!("Could not send ping: {}", e);
            }
        }

        let now = Instant::now();
        next_ping = next_ping_after(next_ping, interval, now);
        if !signal.sleep(next_ping.saturating_duration_since(now)) {
            return;
        }
    }
}

/// Keeps pings on a fixed schedule; a schedule more than a period behind
/// restarts from `now`.
fn next_ping_after(scheduled: Instant, interval: Duration, now: Instant) -> Instant {
    let next = scheduled + interval;
    if next < now { now + interval } else { next }
}
