use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::config::DEFAULT_MAX_CLIENTS;
use super::protocol::{ANONYMOUS_CONNECTION_ID, MAX_CONNECTION_ID, next_connection_id};
use super::tracking::DeliveryLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// Server-side record of one connected client.
#[derive(Debug)]
pub struct Session {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub ledger: DeliveryLedger,
    pub last_receive_time: Instant,
    pub latency: Option<Duration>,
    pub connected_at: Instant,
    /// Cleared when the session leaves the table, so a thread still holding
    /// the session handle knows to stop using it.
    pub active: bool,
}

impl Session {
    pub fn new(client_id: u32, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            addr,
            ledger: DeliveryLedger::new(),
            last_receive_time: now,
            latency: None,
            connected_at: now,
            active: true,
        }
    }

    pub fn matches(&self, addr: SocketAddr) -> bool {
        self.addr == addr
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() >= timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Sessions keyed by connection id, plus the cyclic id allocator.
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<u32, SessionHandle>,
    last_assigned_id: u32,
    max_clients: usize,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl SessionTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            last_assigned_id: ANONYMOUS_CONNECTION_ID,
            max_clients: max_clients.min(MAX_CONNECTION_ID as usize),
        }
    }

    /// Next free id after the last one handed out, or the anonymous id when
    /// the table is full.
    pub fn next_client_id(&mut self) -> u32 {
        if self.is_full() {
            return ANONYMOUS_CONNECTION_ID;
        }

        let mut candidate = self.last_assigned_id;
        for _ in 0..MAX_CONNECTION_ID {
            candidate = next_connection_id(candidate);
            if !self.sessions.contains_key(&candidate) {
                self.last_assigned_id = candidate;
                return candidate;
            }
        }
        ANONYMOUS_CONNECTION_ID
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_clients
    }

    /// Registers a session. Fails for the anonymous id, an id already in use,
    /// or a full table.
    pub fn insert(&mut self, session: Session) -> Option<SessionHandle> {
        let client_id = session.client_id;
        if client_id == ANONYMOUS_CONNECTION_ID
            || self.sessions.contains_key(&client_id)
            || self.is_full()
        {
            return None;
        }

        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(client_id, Arc::clone(&handle));
        Some(handle)
    }

    pub fn get(&self, client_id: u32) -> Option<SessionHandle> {
        self.sessions.get(&client_id).cloned()
    }

    pub fn remove(&mut self, client_id: u32) -> Option<SessionHandle> {
        self.sessions.remove(&client_id)
    }

    pub fn contains(&self, client_id: u32) -> bool {
        self.sessions.contains_key(&client_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) -> Vec<SessionHandle> {
        self.last_assigned_id = ANONYMOUS_CONNECTION_ID;
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }

    /// Removes every session silent for at least `timeout`.
    ///
    /// Returns the removed ids and how long until the next remaining session
    /// would time out.
    pub fn sweep_timed_out(&mut self, timeout: Duration) -> (Vec<u32>, Option<Duration>) {
        let mut timed_out = Vec::new();
        let mut next_expiry: Option<Duration> = None;
        if self.is_empty() {
            return (timed_out, next_expiry);
        }

        for (&client_id, handle) in &self.sessions {
            let mut session = match handle.lock() {
                Ok(session) => session,
                Err(poisoned) => poisoned.into_inner(),
            };
            if session.is_timed_out(timeout) {
                session.active = false;
                timed_out.push(client_id);
            } else {
                let remaining = timeout.saturating_sub(session.last_receive_time.elapsed());
                next_expiry = Some(next_expiry.map_or(remaining, |d| d.min(remaining)));
            }
        }

        for client_id in &timed_out {
            self.sessions.remove(client_id);
        }
        timed_out.sort_unstable();

        (timed_out, next_expiry)
    }
}
