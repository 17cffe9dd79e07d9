use std::collections::HashMap;

use nightingale::{ClientConnection, ClientEvent};

const MAX_RESENDS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Latency,
    Stats,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Self::Empty;
        }

        match line.strip_prefix('/') {
            Some(command) => match command.trim() {
                "quit" | "q" => Self::Quit,
                "latency" | "ping" => Self::Latency,
                "stats" => Self::Stats,
                other => Self::Unknown(other.to_owned()),
            },
            None => Self::Say(line.to_owned()),
        }
    }
}

/// What the main loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Chat {
    client: ClientConnection,
    resends: HashMap<u32, u32>,
}

impl Chat {
    pub fn new(client: ClientConnection) -> Self {
        Self {
            client,
            resends: HashMap::new(),
        }
    }

    pub fn handle_event(&mut self, event: ClientEvent) -> (Vec<String>, Flow) {
        match event {
            ClientEvent::Connected => {
                let id = self.client.connection_id().unwrap_or_default();
                (vec![format!("* connected as client {}", id)], Flow::Continue)
            }
            ClientEvent::CouldNotConnect(reason) => {
                (vec![format!("* could not connect: {}", reason)], Flow::Exit)
            }
            ClientEvent::Disconnected(reason) => {
                self.resends.clear();
                (vec![format!("* disconnected: {}", reason)], Flow::Exit)
            }
            ClientEvent::Received(message) => (vec![message], Flow::Continue),
            ClientEvent::MessageNotDelivered {
                message_id,
                resend_of,
                message,
            } => (self.resend(message_id, resend_of, message), Flow::Continue),
        }
    }

    pub fn handle_command(&mut self, command: Command) -> (Vec<String>, Flow) {
        match command {
            Command::Say(message) => match self.client.send(&message) {
                Ok(id) => {
                    log::debug!("Sent message {}", id);
                    (Vec::new(), Flow::Continue)
                }
                Err(e) => (vec![format!("* could not send: {}", e)], Flow::Continue),
            },
            Command::Latency => {
                let line = match self.client.latency() {
                    Some(latency) => format!("* latency {}ms", latency.as_millis()),
                    None => "* latency unknown".to_owned(),
                };
                (vec![line], Flow::Continue)
            }
            Command::Stats => {
                let stats = self.client.stats();
                (
                    vec![format!(
                        "* {} packets sent, {} received, {} discarded",
                        stats.packets_sent, stats.packets_received, stats.packets_discarded
                    )],
                    Flow::Continue,
                )
            }
            Command::Quit => {
                self.client.disconnect();
                (Vec::new(), Flow::Exit)
            }
            Command::Empty => (Vec::new(), Flow::Continue),
            Command::Unknown(name) => (vec![format!("* unknown command /{}", name)], Flow::Continue),
        }
    }

    fn resend(&mut self, message_id: u32, original: u32, message: Option<String>) -> Vec<String> {
        let attempts = self.resends.entry(original).or_insert(0);
        if *attempts >= MAX_RESENDS {
            self.resends.remove(&original);
            return vec![format!("* message {} was lost", original)];
        }
        *attempts += 1;

        let message = message.unwrap_or_default();
        match self.client.resend(original, &message) {
            Ok(id) => {
                log::debug!("Message {} not delivered, resent as {}", message_id, id);
                Vec::new()
            }
            Err(e) => vec![format!("* could not resend message {}: {}", original, e)],
        }
    }
}
