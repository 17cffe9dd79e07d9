use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::config::ServerConfig;
use super::connection::{Session, SessionHandle, SessionTable};
use super::protocol::{ANONYMOUS_CONNECTION_ID, MessageType, Packet};
use super::stats::NetworkStats;
use super::transport::{SendError, Transport};
use super::worker::{StopSignal, Worker};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const STOP_REASON: &str = "Server stopping.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDisconnectReason {
    RequestedByClient,
    TimedOut,
    DroppedByServer,
    CouldNotAccept,
}

impl ClientDisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestedByClient => "Disconnect requested by client.",
            Self::TimedOut => "Client timed out.",
            Self::DroppedByServer => "Client dropped by server.",
            Self::CouldNotAccept => "Could not accept client connection.",
        }
    }
}

impl fmt::Display for ClientDisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        client_id: u32,
        addr: SocketAddr,
    },
    ConnectionRefused {
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: u32,
        reason: ClientDisconnectReason,
    },
    Received {
        client_id: u32,
        message: String,
    },
    MessageNotDelivered {
        message_id: u32,
        resend_of: u32,
        client_id: u32,
        message: Option<String>,
    },
    ServerStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("server is already running")]
    AlreadyStarted,
    #[error("could not open socket on {addr}: {source}")]
    CouldNotOpenSocket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Point-in-time view of one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub latency: Option<Duration>,
    pub connected_at: Instant,
    pub last_receive_time: Instant,
}

/// Decides whether a client may connect, given the id it would get and
/// where it is connecting from.
pub type AcceptPolicy = Box<dyn Fn(u32, SocketAddr) -> bool + Send + Sync>;

enum AcceptOutcome {
    Accepted,
    SendFailed,
    Unregistered,
}

struct Endpoint {
    transport: Arc<Transport>,
    receiver: Worker,
    sweeper: Worker,
}

struct ServerState {
    endpoint: Option<Endpoint>,
    /// Bumped on every start and stop so workers of a previous run go quiet.
    generation: u64,
    sessions: SessionTable,
}

impl ServerState {
    fn transport(&self, generation: u64) -> Option<Arc<Transport>> {
        if self.generation != generation {
            return None;
        }
        self.endpoint.as_ref().map(|e| Arc::clone(&e.transport))
    }
}

struct ServerShared {
    config: ServerConfig,
    events: Sender<ServerEvent>,
    accept_policy: AcceptPolicy,
    state: Mutex<ServerState>,
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accepts client connections on one UDP socket and tracks a session per
/// client.
///
/// Locks are taken table first, then session, never the other way round.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> (Self, Receiver<ServerEvent>) {
        Self::with_accept_policy(config, |_, _| true)
    }

    pub fn with_accept_policy<P>(config: ServerConfig, policy: P) -> (Self, Receiver<ServerEvent>)
    where
        P: Fn(u32, SocketAddr) -> bool + Send + Sync + 'static,
    {
        let (events, receiver) = mpsc::channel();
        let sessions = SessionTable::new(config.max_clients);
        let shared = Arc::new(ServerShared {
            config,
            events,
            accept_policy: Box::new(policy),
            state: Mutex::new(ServerState {
                endpoint: None,
                generation: 0,
                sessions,
            }),
        });
        (Self { shared }, receiver)
    }

    /// Listens on every IPv4 interface at `port`; 0 picks a free port.
    pub fn start(&self, port: u16) -> Result<(), StartError> {
        self.start_on((Ipv4Addr::UNSPECIFIED, port).into())
    }

    pub fn start_on(&self, addr: SocketAddr) -> Result<(), StartError> {
        let mut state = self.shared.lock();
        if state.endpoint.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        let open_error = |source: io::Error| StartError::CouldNotOpenSocket { addr, source };
        let transport = Transport::bind(addr, self.shared.config.packet_loss.clone())
            .map(Arc::new)
            .map_err(open_error)?;

        state.generation += 1;
        let generation = state.generation;

        let weak = Arc::downgrade(&self.shared);
        let receiver = transport
            .spawn_receiver("nightingale-server-recv", move |packet, from| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_packet(generation, packet, from);
                }
            })
            .map_err(open_error)?;

        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.config.client_timeout;
        let sweeper = Worker::spawn("nightingale-server-sweep", move |signal| {
            sweep_loop(weak, generation, timeout, signal)
        })
        .map_err(open_error)?;

        log::info!("Server listening on {}", transport.local_addr());
        state.sessions = SessionTable::new(self.shared.config.max_clients);
        state.endpoint = Some(Endpoint {
            transport,
            receiver,
            sweeper,
        });
        Ok(())
    }

    /// Tells every client the server is going away, then closes the socket.
    /// Emits [`ServerEvent::ServerStopped`] once; later calls do nothing.
    pub fn stop(&self) {
        if self.shared.shutdown() {
            log::info!("Server stopped");
            self.shared.emit(ServerEvent::ServerStopped);
        }
    }

    pub fn send(&self, client_id: u32, message: &str) -> Result<u32, SendError> {
        self.shared
            .send_application(client_id, Packet::application(client_id, message))
    }

    pub fn resend(
        &self,
        client_id: u32,
        original_message_id: u32,
        message: &str,
    ) -> Result<u32, SendError> {
        let mut packet = Packet::application(client_id, message);
        packet.header.duplicate_of = original_message_id;
        self.shared.send_application(client_id, packet)
    }

    /// Disconnects a client, telling it why on a best-effort basis. Returns
    /// false if no such client was connected.
    pub fn drop_client(&self, client_id: u32, reason: &str) -> bool {
        let (handle, transport) = {
            let mut state = self.shared.lock();
            let transport = state.endpoint.as_ref().map(|e| Arc::clone(&e.transport));
            match state.sessions.remove(client_id) {
                Some(handle) => (handle, transport),
                None => return false,
            }
        };

        {
            let mut session = lock_session(&handle);
            session.active = false;
            if let Some(transport) = transport {
                let packet = Packet::force_disconnect(client_id, reason);
                let addr = session.addr;
                if let Err(e) = transport.send_stamped(&mut session.ledger, packet, addr) {
                    log::debug!("Could not notify client {} of drop: {}", client_id, e);
                }
            }
        }

        log::debug!("Dropped client {}: {}", client_id, reason);
        self.shared.emit(ServerEvent::ClientDisconnected {
            client_id,
            reason: ClientDisconnectReason::DroppedByServer,
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().endpoint.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .lock()
            .endpoint
            .as_ref()
            .map(|e| e.transport.local_addr())
    }

    pub fn client_ids(&self) -> Vec<u32> {
        self.shared.lock().sessions.ids()
    }

    pub fn client_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    pub fn is_connected(&self, client_id: u32) -> bool {
        self.shared.lock().sessions.contains(client_id)
    }

    /// Latency the client last reported in a ping.
    pub fn latency(&self, client_id: u32) -> Option<Duration> {
        let handle = self.shared.lock().sessions.get(client_id)?;
        let session = lock_session(&handle);
        session.latency
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        let state = self.shared.lock();
        let mut infos: Vec<ClientInfo> = state
            .sessions
            .handles()
            .iter()
            .map(|handle| {
                let session = lock_session(handle);
                ClientInfo {
                    client_id: session.client_id,
                    addr: session.addr,
                    latency: session.latency,
                    connected_at: session.connected_at,
                    last_receive_time: session.last_receive_time,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.client_id);
        infos
    }

    pub fn stats(&self) -> NetworkStats {
        self.shared
            .lock()
            .endpoint
            .as_ref()
            .map(|e| e.transport.stats())
            .unwrap_or_default()
    }
}

impl ServerShared {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ServerEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Returns false if the server was not running.
    fn shutdown(&self) -> bool {
        let (endpoint, handles) = {
            let mut state = self.lock();
            let Some(endpoint) = state.endpoint.take() else {
                return false;
            };
            state.generation += 1;
            (endpoint, state.sessions.clear())
        };

        for handle in handles {
            let mut session = lock_session(&handle);
            session.active = false;
            let packet = Packet::force_disconnect(session.client_id, STOP_REASON);
            let addr = session.addr;
            if let Err(e) = endpoint
                .transport
                .send_stamped(&mut session.ledger, packet, addr)
            {
                log::debug!("Could not notify client {} of shutdown: {}", session.client_id, e);
            }
        }

        endpoint.receiver.stop();
        endpoint.sweeper.stop();
        true
    }

    fn send_application(&self, client_id: u32, packet: Packet) -> Result<u32, SendError> {
        let (handle, transport) = {
            let state = self.lock();
            let transport = state
                .endpoint
                .as_ref()
                .map(|e| Arc::clone(&e.transport))
                .ok_or(SendError::ServerNotStarted)?;
            let handle = state
                .sessions
                .get(client_id)
                .ok_or(SendError::ClientNotConnected(client_id))?;
            (handle, transport)
        };

        let mut session = lock_session(&handle);
        if !session.active {
            return Err(SendError::ClientNotConnected(client_id));
        }
        let addr = session.addr;
        transport.send_stamped(&mut session.ledger, packet, addr)
    }

    fn handle_packet(&self, generation: u64, packet: Packet, from: SocketAddr) {
        if packet.is_anonymous() {
            if packet.message_type() == MessageType::ConnectRequest {
                self.handle_connect_request(generation, &packet, from);
            } else {
                log::trace!("Ignoring anonymous {:?} from {}", packet.message_type(), from);
            }
            return;
        }

        let client_id = packet.header.connection_id;
        let (handle, transport) = {
            let state = self.lock();
            let Some(transport) = state.transport(generation) else {
                return;
            };
            let Some(handle) = state.sessions.get(client_id) else {
                log::trace!("Ignoring packet from unknown client {}", client_id);
                return;
            };
            (handle, transport)
        };

        let mut events = Vec::new();
        let mut disconnected = false;
        {
            let mut session = lock_session(&handle);
            if !session.active {
                return;
            }
            if !session.matches(from) {
                log::trace!(
                    "Ignoring packet for client {} from {}, expected {}",
                    client_id,
                    from,
                    session.addr
                );
                return;
            }

            if session.ledger.has_seen(&packet) {
                log::trace!("Ignoring already received packet {} from client {}", packet.sequence(), client_id);
            } else if packet.is_duplicate() && session.ledger.has_seen_duplicate_of(&packet) {
                log::trace!(
                    "Ignoring resend of packet {} from client {}",
                    packet.header.duplicate_of,
                    client_id
                );
                session.ledger.record_incoming(&packet);
            } else {
                session.ledger.record_incoming(&packet);
                match packet.message_type() {
                    MessageType::Application => {
                        session.touch();
                        events.push(ServerEvent::Received {
                            client_id,
                            message: packet.payload.clone().unwrap_or_default(),
                        });
                    }
                    MessageType::Ping => {
                        if let Some(latency) = packet.latency_sample() {
                            session.latency = Some(latency);
                        }
                        let addr = session.addr;
                        let response = Packet::ping_response(client_id);
                        if let Err(e) = transport.send_stamped(&mut session.ledger, response, addr) {
                            log::trace!("Could not answer ping from client {}: {}", client_id, e);
                        }
                        session.touch();
                    }
                    MessageType::ClientDisconnect => {
                        log::debug!("Client {} disconnected", client_id);
                        session.active = false;
                        disconnected = true;
                        events.push(ServerEvent::ClientDisconnected {
                            client_id,
                            reason: ClientDisconnectReason::RequestedByClient,
                        });
                    }
                    other => {
                        log::trace!("Ignoring {:?} from client {}", other, client_id);
                    }
                }
            }

            for undelivered in session.ledger.check_delivery() {
                if undelivered.message_type() == MessageType::Application {
                    events.push(ServerEvent::MessageNotDelivered {
                        message_id: undelivered.sequence(),
                        resend_of: undelivered.resend_of(),
                        client_id,
                        message: undelivered.payload,
                    });
                }
            }
        }

        if disconnected {
            let mut state = self.lock();
            if state
                .sessions
                .get(client_id)
                .is_some_and(|current| Arc::ptr_eq(&current, &handle))
            {
                state.sessions.remove(client_id);
            }
        }

        self.emit_all(events);
    }

    fn handle_connect_request(&self, generation: u64, request: &Packet, from: SocketAddr) {
        let (client_id, transport) = {
            let mut state = self.lock();
            let Some(transport) = state.transport(generation) else {
                return;
            };
            (state.sessions.next_client_id(), transport)
        };

        if client_id == ANONYMOUS_CONNECTION_ID {
            log::warn!("Server full, refusing connection from {}", from);
            self.refuse(&transport, from);
            return;
        }

        // The policy is application code; never call it with a lock held.
        if !(self.accept_policy)(client_id, from) {
            log::debug!("Refused connection from {}", from);
            self.refuse(&transport, from);
            return;
        }

        let outcome = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }

            let mut session = Session::new(client_id, from);
            // Record the request so the accept carries an ack for it.
            session.ledger.record_incoming(request);

            match state.sessions.insert(session) {
                Some(handle) => {
                    let mut session = lock_session(&handle);
                    let packet = Packet::connection_accepted(client_id);
                    match transport.send_stamped(&mut session.ledger, packet, from) {
                        Ok(_) => AcceptOutcome::Accepted,
                        Err(e) => {
                            log::warn!("Could not accept client {} at {}: {}", client_id, from, e);
                            session.active = false;
                            drop(session);
                            state.sessions.remove(client_id);
                            AcceptOutcome::SendFailed
                        }
                    }
                }
                None => AcceptOutcome::Unregistered,
            }
        };

        match outcome {
            AcceptOutcome::Accepted => {
                log::debug!("Accepted client {} from {}", client_id, from);
                self.emit(ServerEvent::ClientConnected {
                    client_id,
                    addr: from,
                });
            }
            AcceptOutcome::SendFailed => self.emit(ServerEvent::ClientDisconnected {
                client_id,
                reason: ClientDisconnectReason::CouldNotAccept,
            }),
            AcceptOutcome::Unregistered => {
                log::warn!("Could not register client {} at {}", client_id, from);
                self.refuse(&transport, from);
            }
        }
    }

    fn refuse(&self, transport: &Transport, addr: SocketAddr) {
        if let Err(e) = transport.send_to(&Packet::connection_refused(), addr) {
            log::debug!("Could not refuse connection from {}: {}", addr, e);
        }
        self.emit(ServerEvent::ConnectionRefused { addr });
    }

    fn sweep(&self, generation: u64, timeout: Duration) -> Option<Option<Duration>> {
        let (timed_out, next_expiry) = {
            let mut state = self.lock();
            if state.generation != generation || state.endpoint.is_none() {
                return None;
            }
            state.sessions.sweep_timed_out(timeout)
        };

        for client_id in timed_out {
            log::debug!("Client {} timed out", client_id);
            self.emit(ServerEvent::ClientDisconnected {
                client_id,
                reason: ClientDisconnectReason::TimedOut,
            });
        }
        Some(next_expiry)
    }
}

fn sweep_loop(shared: Weak<ServerShared>, generation: u64, timeout: Duration, signal: StopSignal) {
    loop {
        let next_expiry = match shared.upgrade() {
            Some(shared) => match shared.sweep(generation, timeout) {
                Some(next_expiry) => next_expiry,
                None => return,
            },
            None => return,
        };

        let wait = next_expiry.unwrap_or(timeout).max(MIN_SWEEP_INTERVAL);
        if !signal.sleep(wait) {
            return;
        }
    }
}

fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
