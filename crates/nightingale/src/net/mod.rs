mod client;
mod config;
mod connection;
mod protocol;
mod server;
mod stats;
mod tracking;
mod transport;
mod worker;

pub use client::{ClientConnection, ClientEvent, ConnectError, ConnectFailure, DisconnectReason};
pub use config::{
    ClientConfig, DEFAULT_CLIENT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_CLIENTS, DEFAULT_PING_INTERVAL, ServerConfig,
};
pub use connection::{ConnectionState, Session, SessionHandle, SessionTable};
pub use protocol::{
    ANONYMOUS_CONNECTION_ID, DEFAULT_PORT, EncodingError, HEADER_SIZE, MAX_CONNECTION_ID,
    MAX_PACKET_SIZE, MAX_SEQUENCE, MIN_CONNECTION_ID, MIN_SEQUENCE, MalformedPacketError,
    MessageType, PROTOCOL_MAGIC, Packet, PacketFlags, PacketHeader, SEQUENCE_NOT_APPLICABLE,
    next_connection_id, next_sequence_number, sequence_delta, sequence_greater_than,
};
pub use server::{
    AcceptPolicy, ClientDisconnectReason, ClientInfo, Server, ServerEvent, StartError,
};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{ACK_BITS, DeliveryLedger, LEDGER_WINDOW, PacketReceipt};
pub use transport::{RECEIVE_POLL_INTERVAL, SendError, Transport};
