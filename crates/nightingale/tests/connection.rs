use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use nightingale::{
    ClientConfig, ClientConnection, ClientDisconnectReason, ClientEvent, ConnectFailure,
    ConnectionState, DisconnectReason, MessageType, Packet, SendError, Server, ServerConfig,
    ServerEvent,
};

const WAIT_MS: u64 = 3000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn start_server(config: ServerConfig) -> (Server, Receiver<ServerEvent>, SocketAddr) {
    let (server, events) = Server::new(config);
    server.start_on(loopback()).unwrap();
    let addr = server.local_addr().unwrap();
    (server, events, addr)
}

/// Waits for the first event matching `predicate`, skipping others.
fn wait_for<E, F>(events: &Receiver<E>, timeout_ms: u64, mut predicate: F) -> Option<E>
where
    F: FnMut(&E) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(remaining) {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn connect_client(
    config: ClientConfig,
    server_addr: SocketAddr,
    server_events: &Receiver<ServerEvent>,
) -> (ClientConnection, Receiver<ClientEvent>, u32) {
    let (client, events) = ClientConnection::new(config);
    client.connect_to(server_addr).unwrap();

    wait_for(&events, WAIT_MS, |e| *e == ClientEvent::Connected).expect("client never connected");
    let client_id = match wait_for(server_events, WAIT_MS, |e| {
        matches!(e, ServerEvent::ClientConnected { .. })
    }) {
        Some(ServerEvent::ClientConnected { client_id, .. }) => client_id,
        other => panic!("expected ClientConnected, got {:?}", other),
    };

    assert_eq!(client.connection_id(), Some(client_id));
    (client, events, client_id)
}

fn raw_socket() -> UdpSocket {
    let socket = UdpSocket::bind(loopback()).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(WAIT_MS)))
        .unwrap();
    socket
}

fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buffer = [0u8; 512];
    let (size, from) = socket.recv_from(&mut buffer).expect("no datagram");
    (Packet::decode(&buffer[..size]).unwrap(), from)
}

fn send_packet(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
    socket.send_to(&packet.encode().unwrap(), addr).unwrap();
}

/// Plays the server side of a handshake on a raw socket. Returns the
/// client's address.
fn accept_raw_client(fake_server: &UdpSocket, connection_id: u32) -> SocketAddr {
    let (request, client_addr) = recv_packet(fake_server);
    assert_eq!(request.message_type(), MessageType::ConnectRequest);
    assert!(request.is_anonymous());
    assert_eq!(request.sequence(), 1);

    let mut accepted = Packet::connection_accepted(connection_id);
    accepted.header.sequence = 1;
    accepted.header.ack = request.sequence();
    send_packet(fake_server, &accepted, client_addr);
    client_addr
}

/// Ack bitfield relative to `ack` with every bit set except `missing`.
fn ack_bits_except(missing: u32, ack: u32) -> u32 {
    (1..=32u32)
        .filter(|&distance| ack.checked_sub(distance) != Some(missing))
        .fold(0, |bits, distance| bits | 1 << (distance - 1))
}

/// Reads datagrams until one with `sequence` arrives.
fn drain_until(socket: &UdpSocket, sequence: u32) {
    loop {
        let (packet, _) = recv_packet(socket);
        if packet.sequence() == sequence {
            return;
        }
    }
}

#[test]
fn test_connect_and_exchange_messages() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (client, client_events, client_id) =
        connect_client(ClientConfig::default(), addr, &server_events);

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.client_ids(), vec![client_id]);

    client.send("HELLO").unwrap();
    let received = wait_for(&server_events, WAIT_MS, |e| {
        matches!(e, ServerEvent::Received { .. })
    });
    assert_eq!(
        received,
        Some(ServerEvent::Received {
            client_id,
            message: "HELLO".to_owned(),
        })
    );

    server.send(client_id, "WORLD").unwrap();
    let reply = wait_for(&client_events, WAIT_MS, |e| {
        matches!(e, ClientEvent::Received(_))
    });
    assert_eq!(reply, Some(ClientEvent::Received("WORLD".to_owned())));

    server.stop();
}

#[test]
fn test_refused_connection() {
    init_logging();
    let (server, server_events) = Server::with_accept_policy(ServerConfig::default(), |_, _| false);
    server.start_on(loopback()).unwrap();
    let addr = server.local_addr().unwrap();

    let (client, client_events) = ClientConnection::new(ClientConfig::default());
    client.connect_to(addr).unwrap();

    let event = wait_for(&client_events, WAIT_MS, |e| {
        matches!(e, ClientEvent::CouldNotConnect(_))
    });
    assert_eq!(
        event,
        Some(ClientEvent::CouldNotConnect(ConnectFailure::Refused))
    );
    assert!(matches!(
        wait_for(&server_events, WAIT_MS, |e| matches!(e, ServerEvent::ConnectionRefused { .. })),
        Some(ServerEvent::ConnectionRefused { .. })
    ));

    assert_eq!(server.client_count(), 0);
    assert_eq!(client.state(), ConnectionState::Idle);
    assert!(matches!(client.send("HELLO"), Err(SendError::NotConnected)));

    server.stop();
}

#[test]
fn test_connect_request_times_out() {
    init_logging();
    let silent = raw_socket();
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let (client, events) = ClientConnection::new(config);
    client.connect_to(silent.local_addr().unwrap()).unwrap();
    assert!(client.is_connecting());

    let event = wait_for(&events, WAIT_MS, |_| true);
    assert_eq!(
        event,
        Some(ClientEvent::CouldNotConnect(ConnectFailure::TimedOut))
    );
    assert_eq!(
        ConnectFailure::TimedOut.to_string(),
        "Connect request timed out."
    );
    assert_eq!(client.state(), ConnectionState::Idle);
}

#[test]
fn test_silent_server_times_out() {
    init_logging();
    let fake_server = raw_socket();
    let config = ClientConfig {
        connection_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..ClientConfig::default()
    };
    let (client, events) = ClientConnection::new(config);
    client.connect_to(fake_server.local_addr().unwrap()).unwrap();
    accept_raw_client(&fake_server, 1);

    assert_eq!(wait_for(&events, WAIT_MS, |_| true), Some(ClientEvent::Connected));

    let event = wait_for(&events, WAIT_MS, |e| {
        matches!(e, ClientEvent::Disconnected(_))
    });
    assert_eq!(
        event,
        Some(ClientEvent::Disconnected(DisconnectReason::TimedOut))
    );
    assert_eq!(DisconnectReason::TimedOut.to_string(), "Connection timed out.");
    assert!(matches!(client.send("late"), Err(SendError::NotConnected)));

    // The server is told on a best-effort basis, after the initial ping.
    let notice = loop {
        let (packet, _) = recv_packet(&fake_server);
        if packet.message_type() != MessageType::Ping {
            break packet;
        }
    };
    assert_eq!(notice.message_type(), MessageType::ClientDisconnect);
    assert_eq!(notice.header.connection_id, 1);
}

#[test]
fn test_disconnect_abandons_connect_attempt() {
    init_logging();
    let fake_server = raw_socket();
    let (client, events) = ClientConnection::new(ClientConfig::default());
    client.connect_to(fake_server.local_addr().unwrap()).unwrap();

    let (request, client_addr) = recv_packet(&fake_server);
    assert_eq!(request.message_type(), MessageType::ConnectRequest);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Idle);
    assert_eq!(client.server_addr(), None);

    let mut accepted = Packet::connection_accepted(1);
    accepted.header.sequence = 1;
    accepted.header.ack = request.sequence();
    send_packet(&fake_server, &accepted, client_addr);

    assert_eq!(wait_for(&events, 500, |_| true), None);
    assert_eq!(client.state(), ConnectionState::Idle);
    assert_eq!(client.connection_id(), None);
}

#[test]
fn test_undelivered_message_reported_once() {
    init_logging();
    let fake_server = raw_socket();
    let config = ClientConfig {
        ping_interval: Duration::from_secs(60),
        ..ClientConfig::default()
    };
    let (client, events) = ClientConnection::new(config);
    client.connect_to(fake_server.local_addr().unwrap()).unwrap();
    let client_addr = accept_raw_client(&fake_server, 1);
    assert_eq!(wait_for(&events, WAIT_MS, |_| true), Some(ClientEvent::Connected));

    let lost = client.send("A").unwrap();
    let last = client.send("B").unwrap();

    // Drain everything up to "B" so the reply acknowledges it.
    drain_until(&fake_server, last);

    let mut reply = Packet::application(1, "ack");
    reply.header.sequence = 2;
    reply.header.ack = last;
    reply.header.ack_bitfield = ack_bits_except(lost, last);
    send_packet(&fake_server, &reply, client_addr);

    let event = wait_for(&events, WAIT_MS, |e| {
        matches!(e, ClientEvent::MessageNotDelivered { .. })
    });
    assert_eq!(
        event,
        Some(ClientEvent::MessageNotDelivered {
            message_id: lost,
            resend_of: lost,
            message: Some("A".to_owned()),
        })
    );

    // Same acknowledgment again: nothing new to report.
    reply.header.sequence = 3;
    send_packet(&fake_server, &reply, client_addr);
    assert_eq!(
        wait_for(&events, 300, |e| matches!(e, ClientEvent::MessageNotDelivered { .. })),
        None
    );

    // A lost resend points back at the first transmission.
    let resent = client.resend(lost, "A").unwrap();
    let after = client.send("C").unwrap();
    let (packet, _) = recv_packet(&fake_server);
    assert_eq!(packet.sequence(), resent);
    assert_eq!(packet.header.duplicate_of, lost);
    let (packet, _) = recv_packet(&fake_server);
    assert_eq!(packet.sequence(), after);

    reply.header.sequence = 4;
    reply.header.ack = after;
    reply.header.ack_bitfield = ack_bits_except(resent, after);
    send_packet(&fake_server, &reply, client_addr);

    let event = wait_for(&events, WAIT_MS, |e| {
        matches!(e, ClientEvent::MessageNotDelivered { .. })
    });
    assert_eq!(
        event,
        Some(ClientEvent::MessageNotDelivered {
            message_id: resent,
            resend_of: lost,
            message: Some("A".to_owned()),
        })
    );
}

#[test]
fn test_server_reports_undelivered_message() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let raw_client = raw_socket();

    let mut request = Packet::connect_request();
    request.header.sequence = 1;
    send_packet(&raw_client, &request, addr);

    let (accepted, _) = recv_packet(&raw_client);
    assert_eq!(accepted.message_type(), MessageType::ConnectionAccepted);
    let client_id = accepted.header.connection_id;

    // Acknowledge the accept so the server has a starting point.
    let mut hello = Packet::application(client_id, "hello");
    hello.header.sequence = 2;
    hello.header.ack = accepted.sequence();
    send_packet(&raw_client, &hello, addr);
    assert!(
        wait_for(&server_events, WAIT_MS, |e| matches!(e, ServerEvent::Received { .. })).is_some()
    );

    let lost = server.send(client_id, "A").unwrap();
    let last = server.send(client_id, "B").unwrap();
    drain_until(&raw_client, last);

    let mut reply = Packet::application(client_id, "ack");
    reply.header.sequence = 3;
    reply.header.ack = last;
    reply.header.ack_bitfield = ack_bits_except(lost, last);
    send_packet(&raw_client, &reply, addr);

    let event = wait_for(&server_events, WAIT_MS, |e| {
        matches!(e, ServerEvent::MessageNotDelivered { .. })
    });
    assert_eq!(
        event,
        Some(ServerEvent::MessageNotDelivered {
            message_id: lost,
            resend_of: lost,
            client_id,
            message: Some("A".to_owned()),
        })
    );

    // A lost resend points back at the first transmission.
    let resent = server.resend(client_id, lost, "A").unwrap();
    let after = server.send(client_id, "C").unwrap();
    let (packet, _) = recv_packet(&raw_client);
    assert_eq!(packet.sequence(), resent);
    assert_eq!(packet.header.duplicate_of, lost);
    drain_until(&raw_client, after);

    reply.header.sequence = 4;
    reply.header.ack = after;
    reply.header.ack_bitfield = ack_bits_except(resent, after);
    send_packet(&raw_client, &reply, addr);

    let event = wait_for(&server_events, WAIT_MS, |e| {
        matches!(e, ServerEvent::MessageNotDelivered { .. })
    });
    assert_eq!(
        event,
        Some(ServerEvent::MessageNotDelivered {
            message_id: resent,
            resend_of: lost,
            client_id,
            message: Some("A".to_owned()),
        })
    );

    server.stop();
}

#[test]
fn test_server_processes_resends_once() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let raw_client = raw_socket();

    let mut request = Packet::connect_request();
    request.header.sequence = 1;
    send_packet(&raw_client, &request, addr);

    let (accepted, _) = recv_packet(&raw_client);
    assert_eq!(accepted.message_type(), MessageType::ConnectionAccepted);
    assert_eq!(accepted.header.ack, 1);
    let client_id = accepted.header.connection_id;

    let mut original = Packet::application(client_id, "X");
    original.header.sequence = 2;
    send_packet(&raw_client, &original, addr);

    let mut resend = Packet::application(client_id, "X");
    resend.header.sequence = 3;
    resend.header.duplicate_of = 2;
    send_packet(&raw_client, &resend, addr);
    send_packet(&raw_client, &original, addr);

    let mut next = Packet::application(client_id, "Y");
    next.header.sequence = 4;
    send_packet(&raw_client, &next, addr);

    let received: Vec<String> = (0..2)
        .filter_map(|_| {
            wait_for(&server_events, WAIT_MS, |e| {
                matches!(e, ServerEvent::Received { .. })
            })
        })
        .map(|event| match event {
            ServerEvent::Received { message, .. } => message,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(received, vec!["X".to_owned(), "Y".to_owned()]);

    server.stop();
}

#[test]
fn test_packets_from_wrong_endpoint_are_ignored() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (_client, _client_events, client_id) =
        connect_client(ClientConfig::default(), addr, &server_events);

    let impostor = raw_socket();
    let mut spoofed = Packet::application(client_id, "spoofed");
    spoofed.header.sequence = 500;
    send_packet(&impostor, &spoofed, addr);

    assert_eq!(
        wait_for(&server_events, 300, |e| matches!(e, ServerEvent::Received { .. })),
        None
    );
    server.stop();
}

#[test]
fn test_client_disconnect() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (client, client_events, client_id) =
        connect_client(ClientConfig::default(), addr, &server_events);

    client.disconnect();
    assert_eq!(
        wait_for(&client_events, WAIT_MS, |e| matches!(e, ClientEvent::Disconnected(_))),
        Some(ClientEvent::Disconnected(DisconnectReason::RequestedByClient))
    );
    assert_eq!(
        wait_for(&server_events, WAIT_MS, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        }),
        Some(ServerEvent::ClientDisconnected {
            client_id,
            reason: ClientDisconnectReason::RequestedByClient,
        })
    );
    assert_eq!(server.client_count(), 0);
    assert!(matches!(client.send("gone"), Err(SendError::NotConnected)));

    server.stop();
}

#[test]
fn test_server_drops_client() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (client, client_events, client_id) =
        connect_client(ClientConfig::default(), addr, &server_events);

    assert!(server.drop_client(client_id, "Kicked."));
    assert!(!server.is_connected(client_id));

    assert_eq!(
        wait_for(&client_events, WAIT_MS, |e| matches!(e, ClientEvent::Disconnected(_))),
        Some(ClientEvent::Disconnected(DisconnectReason::ForcedByServer(
            Some("Kicked.".to_owned())
        )))
    );
    assert_eq!(
        wait_for(&server_events, WAIT_MS, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        }),
        Some(ServerEvent::ClientDisconnected {
            client_id,
            reason: ClientDisconnectReason::DroppedByServer,
        })
    );
    assert!(!client.is_connected());
    assert!(matches!(
        server.send(client_id, "hello?"),
        Err(SendError::ClientNotConnected(id)) if id == client_id
    ));

    server.stop();
}

#[test]
fn test_server_stop_disconnects_clients() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (client, client_events, _) =
        connect_client(ClientConfig::default(), addr, &server_events);

    server.stop();
    assert_eq!(
        wait_for(&server_events, WAIT_MS, |e| *e == ServerEvent::ServerStopped),
        Some(ServerEvent::ServerStopped)
    );
    assert_eq!(
        wait_for(&client_events, WAIT_MS, |e| matches!(e, ClientEvent::Disconnected(_))),
        Some(ClientEvent::Disconnected(DisconnectReason::ForcedByServer(
            Some("Server stopping.".to_owned())
        )))
    );

    assert!(!server.is_running());
    assert!(matches!(server.send(1, "x"), Err(SendError::ServerNotStarted)));
    assert!(!client.is_connected());

    // Restarting hands out a fresh table.
    server.start_on(loopback()).unwrap();
    assert_eq!(server.client_count(), 0);
    server.stop();
}

#[test]
fn test_server_times_out_silent_client() {
    init_logging();
    let config = ServerConfig {
        client_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (server, server_events, addr) = start_server(config);
    let raw_client = raw_socket();

    let mut request = Packet::connect_request();
    request.header.sequence = 1;
    send_packet(&raw_client, &request, addr);
    let (accepted, _) = recv_packet(&raw_client);
    let client_id = accepted.header.connection_id;

    assert_eq!(
        wait_for(&server_events, WAIT_MS, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        }),
        Some(ServerEvent::ClientDisconnected {
            client_id,
            reason: ClientDisconnectReason::TimedOut,
        })
    );
    assert_eq!(server.client_count(), 0);
    server.stop();
}

#[test]
fn test_full_server_refuses() {
    init_logging();
    let config = ServerConfig {
        max_clients: 1,
        ..ServerConfig::default()
    };
    let (server, server_events, addr) = start_server(config);
    let (_first, _first_events, _) =
        connect_client(ClientConfig::default(), addr, &server_events);

    let (second, second_events) = ClientConnection::new(ClientConfig::default());
    second.connect_to(addr).unwrap();
    assert_eq!(
        wait_for(&second_events, WAIT_MS, |e| {
            matches!(e, ClientEvent::CouldNotConnect(_))
        }),
        Some(ClientEvent::CouldNotConnect(ConnectFailure::Refused))
    );
    assert_eq!(server.client_count(), 1);
    server.stop();
}

#[test]
fn test_latency_is_measured_both_ways() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let config = ClientConfig {
        ping_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let (client, _client_events, client_id) = connect_client(config, addr, &server_events);

    let deadline = Instant::now() + Duration::from_millis(WAIT_MS);
    while (client.latency().is_none() || server.latency(client_id).is_none())
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(20));
    }

    let latency = client.latency().expect("client never measured latency");
    assert!(latency < Duration::from_secs(1));
    assert!(server.latency(client_id).is_some());

    let info = server
        .client_infos()
        .into_iter()
        .find(|info| info.client_id == client_id)
        .unwrap();
    assert_eq!(Some(info.addr.port()), client.local_addr().map(|a| a.port()));

    server.stop();
}

#[test]
fn test_reconnect_while_connected() {
    init_logging();
    let (server, server_events, addr) = start_server(ServerConfig::default());
    let (client, client_events, first_id) =
        connect_client(ClientConfig::default(), addr, &server_events);

    client.connect_to(addr).unwrap();
    assert_eq!(
        wait_for(&client_events, WAIT_MS, |_| true),
        Some(ClientEvent::Disconnected(DisconnectReason::RequestedByClient))
    );
    assert_eq!(
        wait_for(&client_events, WAIT_MS, |_| true),
        Some(ClientEvent::Connected)
    );

    let second_id = client.connection_id().unwrap();
    assert_ne!(first_id, second_id);
    server.stop();
}
