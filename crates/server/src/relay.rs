use std::collections::HashMap;

use log::Level;
use nightingale::{Server, ServerEvent};

/// Times an undelivered message is resent before the relay gives up on it.
pub const MAX_RESENDS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: Level,
    pub text: String,
}

impl Notice {
    fn info(text: String) -> Self {
        Self {
            level: Level::Info,
            text,
        }
    }

    fn warn(text: String) -> Self {
        Self {
            level: Level::Warn,
            text,
        }
    }
}

/// Counts resends per (client, original message id).
#[derive(Debug, Default)]
pub struct ResendBudget {
    attempts: HashMap<(u32, u32), u32>,
}

impl ResendBudget {
    /// Returns true and records an attempt if `original` may be resent again.
    pub fn try_spend(&mut self, client_id: u32, original: u32) -> bool {
        let attempts = self.attempts.entry((client_id, original)).or_insert(0);
        if *attempts >= MAX_RESENDS {
            return false;
        }
        *attempts += 1;
        true
    }

    pub fn forget_client(&mut self, client_id: u32) {
        self.attempts.retain(|&(id, _), _| id != client_id);
    }
}

/// Chat relay: every message a client sends goes out to every connected
/// client, and messages a client reports missing are resent.
pub struct Relay {
    server: Server,
    budget: ResendBudget,
}

impl Relay {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            budget: ResendBudget::default(),
        }
    }

    pub fn handle(&mut self, event: ServerEvent) -> Vec<Notice> {
        match event {
            ServerEvent::ClientConnected { client_id, addr } => {
                vec![Notice::info(format!("Client {} connected from {}", client_id, addr))]
            }
            ServerEvent::ConnectionRefused { addr } => {
                vec![Notice::warn(format!("Refused connection from {}", addr))]
            }
            ServerEvent::ClientDisconnected { client_id, reason } => {
                self.budget.forget_client(client_id);
                vec![Notice::info(format!("Client {}: {}", client_id, reason))]
            }
            ServerEvent::Received { client_id, message } => self.broadcast(client_id, &message),
            ServerEvent::MessageNotDelivered {
                message_id,
                resend_of,
                client_id,
                message,
            } => self.resend(client_id, message_id, resend_of, message.as_deref()),
            ServerEvent::ServerStopped => vec![Notice::info("Server stopped".to_owned())],
        }
    }

    fn broadcast(&self, from: u32, message: &str) -> Vec<Notice> {
        let line = format_chat_line(from, message);
        let mut notices = vec![Notice::info(line.clone())];

        for client_id in self.server.client_ids() {
            if let Err(e) = self.server.send(client_id, &line) {
                notices.push(Notice::warn(format!(
                    "Could not relay to client {}: {}",
                    client_id, e
                )));
            }
        }
        notices
    }

    fn resend(
        &mut self,
        client_id: u32,
        message_id: u32,
        resend_of: u32,
        message: Option<&str>,
    ) -> Vec<Notice> {
        if !self.budget.try_spend(client_id, resend_of) {
            return vec![Notice::warn(format!(
                "Giving up on message {} to client {}",
                resend_of, client_id
            ))];
        }

        let message = message.unwrap_or_default();
        match self.server.resend(client_id, resend_of, message) {
            Ok(new_id) => {
                log::debug!(
                    "Resent message {} to client {} as {} (original {})",
                    message_id,
                    client_id,
                    new_id,
                    resend_of
                );
                Vec::new()
            }
            Err(e) => vec![Notice::warn(format!(
                "Could not resend message {} to client {}: {}",
                resend_of, client_id, e
            ))],
        }
    }
}

pub fn format_chat_line(client_id: u32, message: &str) -> String {
    format!("[{}] {}", client_id, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightingale::ServerConfig;

    #[test]
    fn test_resend_budget_is_bounded() {
        let mut budget = ResendBudget::default();
        for _ in 0..MAX_RESENDS {
            assert!(budget.try_spend(1, 10));
        }
        assert!(!budget.try_spend(1, 10));
        assert!(budget.try_spend(1, 11));
        assert!(budget.try_spend(2, 10));
    }

    #[test]
    fn test_forgetting_a_client_resets_its_budget() {
        let mut budget = ResendBudget::default();
        for _ in 0..MAX_RESENDS {
            budget.try_spend(4, 1);
        }
        budget.forget_client(4);
        assert!(budget.try_spend(4, 1));
    }

    #[test]
    fn test_chat_line_format() {
        assert_eq!(format_chat_line(7, "hello"), "[7] hello");
    }

    #[test]
    fn test_lifecycle_notices() {
        let (server, _events) = Server::new(ServerConfig::default());
        let mut relay = Relay::new(server);

        let notices = relay.handle(ServerEvent::ConnectionRefused {
            addr: "127.0.0.1:5000".parse().unwrap(),
        });
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, Level::Warn);

        let notices = relay.handle(ServerEvent::ServerStopped);
        assert_eq!(notices, vec![Notice::info("Server stopped".to_owned())]);
    }
}
