use std::time::Duration;

use super::stats::PacketLossSimulation;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_CLIENTS: usize = 255;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for an answer to a connect request.
    pub connect_timeout: Duration,
    /// Silence from the server after which the connection is dropped.
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            packet_loss: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub client_timeout: Duration,
    /// Clamped to 255, the number of assignable connection ids.
    pub max_clients: usize,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            max_clients: DEFAULT_MAX_CLIENTS,
            packet_loss: None,
        }
    }
}
