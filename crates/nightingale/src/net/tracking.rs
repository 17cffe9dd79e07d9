use std::time::Instant;

use super::protocol::{
    next_sequence_number, sequence_delta, sequence_greater_than, Packet, SEQUENCE_NOT_APPLICABLE,
};

pub const LEDGER_WINDOW: usize = 64;
pub const ACK_BITS: i32 = 32;

const WINDOW: i32 = LEDGER_WINDOW as i32;

#[derive(Debug, Clone)]
pub struct PacketReceipt {
    pub packet: Packet,
    pub time: Instant,
}

impl PacketReceipt {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            time: Instant::now(),
        }
    }
}

/// Per-connection record of recent traffic in both directions.
///
/// The receive side answers "have we processed this already?" and produces
/// the `ack`/`ack_bitfield` pair piggybacked on every outgoing packet. The
/// send side keeps what we sent so the peer's acknowledgments can be turned
/// into a list of packets that never arrived.
///
/// Bit `k - 1` of an ack bitfield means "the packet `k` positions before
/// `ack` was received", for `k` in `1..=32`.
#[derive(Debug)]
pub struct DeliveryLedger {
    received: Vec<Option<PacketReceipt>>,
    last_received_index: usize,
    last_received: u32,
    received_bitfield: u32,
    peer_ack: u32,
    peer_ack_bitfield: u32,

    sent: Vec<Option<PacketReceipt>>,
    last_sent: u32,
    delivery_cursor: u32,
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self {
            received: vec![None; LEDGER_WINDOW],
            last_received_index: 0,
            last_received: SEQUENCE_NOT_APPLICABLE,
            received_bitfield: 0,
            peer_ack: SEQUENCE_NOT_APPLICABLE,
            peer_ack_bitfield: 0,
            sent: vec![None; LEDGER_WINDOW],
            last_sent: SEQUENCE_NOT_APPLICABLE,
            delivery_cursor: SEQUENCE_NOT_APPLICABLE,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_incoming(&mut self, packet: &Packet) {
        if !packet.has_sequence() {
            return;
        }

        let sequence = packet.sequence();
        if self.last_received == SEQUENCE_NOT_APPLICABLE {
            self.restart_window(packet);
            return;
        }

        let delta = sequence_delta(self.last_received, sequence);
        if delta >= WINDOW {
            self.restart_window(packet);
        } else if delta > 0 {
            // The previous newest packet is now `delta` slots back.
            self.received_bitfield = (self.received_bitfield << 1) | 1;
            for offset in 1..delta as usize {
                let index = (self.last_received_index + offset) % LEDGER_WINDOW;
                self.received[index] = None;
                self.received_bitfield <<= 1;
            }

            self.last_received_index = (self.last_received_index + delta as usize) % LEDGER_WINDOW;
            self.received[self.last_received_index] = Some(PacketReceipt::new(packet.clone()));
            self.last_received = sequence;
            self.remember_peer_ack(packet);
        } else if delta < 0 && delta > -WINDOW {
            let index = self.received_index(delta);
            self.received[index] = Some(PacketReceipt::new(packet.clone()));

            let distance = -delta;
            if distance <= ACK_BITS {
                self.received_bitfield |= 1 << (distance - 1);
            }
        }
    }

    pub fn has_seen(&self, packet: &Packet) -> bool {
        self.has_received_sequence(packet.header.sequence)
    }

    pub fn has_seen_duplicate_of(&self, packet: &Packet) -> bool {
        self.has_received_sequence(packet.header.duplicate_of)
    }

    /// Receipt for a packet still inside the receive window.
    #[cfg(test)]
    pub(crate) fn received_receipt(&self, sequence: u32) -> Option<&PacketReceipt> {
        if sequence == SEQUENCE_NOT_APPLICABLE || self.last_received == SEQUENCE_NOT_APPLICABLE {
            return None;
        }
        let delta = sequence_delta(self.last_received, sequence);
        if delta > 0 || delta <= -WINDOW {
            return None;
        }
        self.received[self.received_index(delta)].as_ref()
    }

    /// Stamps the next sequence number and our acknowledgment state onto
    /// `packet`, then records it as sent.
    pub fn stamp_outgoing(&mut self, packet: &mut Packet) -> u32 {
        self.last_sent = next_sequence_number(self.last_sent);

        packet.header.sequence = self.last_sent;
        packet.header.ack = self.last_received;
        packet.header.ack_bitfield = self.received_bitfield;

        let index = self.last_sent as usize % LEDGER_WINDOW;
        self.sent[index] = Some(PacketReceipt::new(packet.clone()));

        self.last_sent
    }

    pub fn sent_receipt(&self, sequence: u32) -> Option<&PacketReceipt> {
        if sequence == SEQUENCE_NOT_APPLICABLE || self.last_sent == SEQUENCE_NOT_APPLICABLE {
            return None;
        }

        let delta = sequence_delta(sequence, self.last_sent);
        if !(0..WINDOW).contains(&delta) {
            return None;
        }

        self.sent[sequence as usize % LEDGER_WINDOW]
            .as_ref()
            .filter(|receipt| receipt.packet.sequence() == sequence)
    }

    /// Packets we sent that the peer's acknowledgment `(watermark, history)`
    /// reports as missing, checked from the last watermark we looked at.
    ///
    /// The first watermark ever seen only anchors the cursor. Each sent
    /// packet is judged at most once.
    pub fn undelivered_since(&mut self, watermark: u32, history: u32) -> Vec<Packet> {
        let mut undelivered = Vec::new();

        if watermark == SEQUENCE_NOT_APPLICABLE {
            return undelivered;
        }
        if self.delivery_cursor == SEQUENCE_NOT_APPLICABLE {
            self.delivery_cursor = watermark;
            return undelivered;
        }
        if !sequence_greater_than(watermark, self.delivery_cursor) {
            return undelivered;
        }

        let mut sequence = next_sequence_number(self.delivery_cursor);
        while sequence != watermark {
            let distance = sequence_delta(sequence, watermark);
            if (1..=ACK_BITS).contains(&distance) && history & (1 << (distance - 1)) == 0 {
                if let Some(receipt) = self.sent_receipt(sequence) {
                    undelivered.push(receipt.packet.clone());
                }
            }
            sequence = next_sequence_number(sequence);
        }

        self.delivery_cursor = watermark;
        undelivered
    }

    /// Runs [`Self::undelivered_since`] against the acknowledgment carried by
    /// the newest packet received from the peer.
    pub fn check_delivery(&mut self) -> Vec<Packet> {
        self.undelivered_since(self.peer_ack, self.peer_ack_bitfield)
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }

    pub fn last_sent(&self) -> u32 {
        self.last_sent
    }

    fn has_received_sequence(&self, sequence: u32) -> bool {
        if sequence == SEQUENCE_NOT_APPLICABLE || self.last_received == SEQUENCE_NOT_APPLICABLE {
            return false;
        }
        if sequence == self.last_received {
            return true;
        }

        let delta = sequence_delta(self.last_received, sequence);
        if delta > 0 {
            return false;
        }
        // Too old to know; assume processed so it is never handled twice.
        if delta <= -WINDOW {
            return true;
        }
        self.received[self.received_index(delta)].is_some()
    }

    fn restart_window(&mut self, packet: &Packet) {
        self.received.iter_mut().for_each(|slot| *slot = None);
        self.received[0] = Some(PacketReceipt::new(packet.clone()));
        self.last_received_index = 0;
        self.last_received = packet.sequence();
        self.received_bitfield = 0;
        self.remember_peer_ack(packet);
    }

    fn remember_peer_ack(&mut self, packet: &Packet) {
        self.peer_ack = packet.header.ack;
        self.peer_ack_bitfield = packet.header.ack_bitfield;
    }

    #[inline]
    fn received_index(&self, delta: i32) -> usize {
        (self.last_received_index as i32 + delta).rem_euclid(WINDOW) as usize
    }
}
