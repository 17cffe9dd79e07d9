use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{EncodingError, MAX_PACKET_SIZE, Packet};
use super::stats::{NetworkStats, PacketLossSimulation, StatsCounters};
use super::tracking::DeliveryLedger;
use super::worker::Worker;

/// Upper bound on how long the receive thread blocks before checking
/// whether it has been stopped.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected to a server")]
    NotConnected,
    #[error("server is not running")]
    ServerNotStarted,
    #[error("client {0} is not connected")]
    ClientNotConnected(u32),
    #[error("could not encode packet: {0}")]
    Encoding(#[from] EncodingError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// A bound UDP socket shared between its receive thread and senders.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    packet_loss: Option<PacketLossSimulation>,
    stats: StatsCounters,
}

impl Transport {
    pub fn bind(addr: SocketAddr, packet_loss: Option<PacketLossSimulation>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            packet_loss: packet_loss.filter(|sim| sim.enabled),
            stats: StatsCounters::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    /// Sends a packet outside any ledger, as-is.
    pub fn send_to(&self, packet: &Packet, addr: SocketAddr) -> Result<usize, SendError> {
        let data = packet.encode()?;
        self.transmit(&data, addr)
    }

    /// Stamps `packet` with the ledger's next sequence number and
    /// acknowledgment state, records it, then sends it.
    ///
    /// The caller must hold whatever lock owns `ledger` for the whole call so
    /// that datagrams leave in sequence order.
    pub fn send_stamped(
        &self,
        ledger: &mut DeliveryLedger,
        mut packet: Packet,
        addr: SocketAddr,
    ) -> Result<u32, SendError> {
        // Reject unencodable packets before they take a sequence number.
        packet.encode()?;

        let sequence = ledger.stamp_outgoing(&mut packet);
        let data = packet.encode()?;

        if self.packet_loss.as_ref().is_some_and(|sim| sim.should_drop()) {
            log::trace!("Simulated loss of {} to {}", packet, addr);
            self.stats.record_simulated_loss();
            return Ok(sequence);
        }

        log::trace!("Sending {} to {}", packet, addr);
        self.transmit(&data, addr)?;
        Ok(sequence)
    }

    /// Starts a thread that hands every well-formed packet carrying our
    /// protocol magic to `handler`. Malformed and foreign datagrams are
    /// dropped here.
    pub(crate) fn spawn_receiver<H>(self: &Arc<Self>, name: &str, mut handler: H) -> io::Result<Worker>
    where
        H: FnMut(Packet, SocketAddr) + Send + 'static,
    {
        let transport = Arc::clone(self);

        Worker::spawn(name, move |signal| {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            while !signal.is_stopped() {
                let (size, addr) = match transport.socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        log::debug!("Receive error on {}: {}", transport.local_addr, e);
                        if !signal.sleep(RECEIVE_POLL_INTERVAL) {
                            break;
                        }
                        continue;
                    }
                };

                let packet = match Packet::decode(&buffer[..size]) {
                    Ok(packet) if packet.is_valid_protocol() => packet,
                    Ok(packet) => {
                        log::trace!(
                            "Discarding packet with foreign protocol {:#010x} from {}",
                            packet.header.protocol,
                            addr
                        );
                        transport.stats.record_discarded();
                        continue;
                    }
                    Err(e) => {
                        log::trace!("Discarding malformed datagram from {}: {}", addr, e);
                        transport.stats.record_discarded();
                        continue;
                    }
                };

                transport.stats.record_received(size);
                log::trace!("Received {} from {}", packet, addr);

                if signal.is_stopped() {
                    break;
                }
                handler(packet, addr);
            }

            log::trace!("Receiver on {} exiting", transport.local_addr);
        })
    }

    fn transmit(&self, data: &[u8], addr: SocketAddr) -> Result<usize, SendError> {
        let bytes = self.socket.send_to(data, addr)?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }
}
