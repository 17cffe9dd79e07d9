//! Reliable messaging over UDP.
//!
//! Every datagram carries a sequence number plus an acknowledgment of the
//! last 33 packets received from the peer. Either side can then tell which
//! of its application messages never arrived and decide whether to resend
//! them, while duplicates and replays are processed at most once.

pub mod net;

pub use net::{
    ClientConfig, ClientConnection, ClientDisconnectReason, ClientEvent, ClientInfo,
    ConnectError, ConnectFailure, ConnectionState, DEFAULT_PORT, DeliveryLedger,
    DisconnectReason, MessageType, NetworkStats, Packet, PacketLossSimulation, SendError, Server,
    ServerConfig, ServerEvent, StartError,
};
