//! Packet protocol session over an injected transport.
//!
//! `send_command` is a request/ack exchange (optionally followed by a RESPONSE);
//! `trigger_event` is fire-and-forget; `wait_for_event` acknowledges the event it
//! was waiting for; `send_data` streams chunks with no per-chunk acknowledgment.
//! Every primitive fails locally and never retries; retry policy is the caller's.

use crate::protocol::{
    Command, EventId, PacketType, EVENT_ID_SIZE, INTER_CHUNK_DELAY_MS, MAX_COMMAND_DATA,
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, POLL_INTERVAL_MS,
};
use crate::transport::{Transport, TransportError};
use crate::wire::{Deframer, Packet, WireError};

/// Size of the channel id prefix on each streamed chunk.
pub const CHANNEL_ID_SIZE: usize = 2;

/// Largest slice of caller data carried by one streamed chunk.
pub const STREAM_CHUNK_SIZE: usize = MAX_COMMAND_DATA - CHANNEL_ID_SIZE;

/// Bound transport plus sequence state. Rebinding resets the sequence counter;
/// the peer is not told.
pub struct Link<T: Transport> {
    transport: T,
    next_sequence: u16,
    rx: Deframer,
    poll_interval_ms: u32,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_sequence: 0,
            rx: Deframer::new(),
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }

    /// Override the sub-timeout used while polling for acks, responses and events.
    pub fn with_poll_interval(mut self, ms: u32) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Swap in a new transport. Returns the old one; buffered bytes and sequence continuity are discarded.
    pub fn rebind(&mut self, transport: T) -> T {
        self.next_sequence = 0;
        self.rx.clear();
        std::mem::replace(&mut self.transport, transport)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Send `command` and wait for its ACK. When `response` is given, also wait for the
    /// matching RESPONSE and copy its payload in (silently truncated to the buffer).
    /// Returns the number of response bytes copied (0 when no response was requested).
    pub fn send_command(
        &mut self,
        command: Command,
        data: &[u8],
        response: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> Result<usize, LinkError> {
        if data.len() > MAX_COMMAND_DATA {
            return Err(LinkError::PayloadTooLarge(data.len()));
        }
        let sequence = self.send_packet(PacketType::Command, command_payload(command, &[data]))?;
        tracing::debug!(?command, sequence, "command sent");

        self.wait_for(timeout_ms, |p| is_ack_for(p, sequence))?
            .ok_or(LinkError::Timeout)?;

        let Some(out) = response else {
            return Ok(0);
        };
        if out.is_empty() {
            return Ok(0);
        }
        let packet = self
            .wait_for(timeout_ms, |p| {
                p.packet_type() == PacketType::Response && p.sequence() == sequence
            })?
            .ok_or(LinkError::Timeout)?;
        let n = packet.payload.len().min(out.len());
        out[..n].copy_from_slice(&packet.payload[..n]);
        Ok(n)
    }

    /// Fire-and-forget EVENT carrying `event` followed by `data`. Returns the sequence used.
    pub fn trigger_event(&mut self, event: EventId, data: &[u8]) -> Result<u16, LinkError> {
        if data.len() > MAX_PAYLOAD_SIZE - EVENT_ID_SIZE {
            return Err(LinkError::PayloadTooLarge(data.len()));
        }
        let mut payload = Vec::with_capacity(EVENT_ID_SIZE + data.len());
        payload.extend_from_slice(&event.to_u32().to_le_bytes());
        payload.extend_from_slice(data);
        let sequence = self.send_packet(PacketType::Event, payload)?;
        tracing::debug!(?event, sequence, "event triggered");
        Ok(sequence)
    }

    /// Wait for an EVENT carrying `event`, acknowledge it, and return the data that followed the id.
    /// Packets that are not that event are discarded.
    pub fn wait_for_event(&mut self, event: EventId, timeout_ms: u32) -> Result<Vec<u8>, LinkError> {
        let wanted = event.to_u32();
        let packet = self
            .wait_for(timeout_ms, |p| event_id_of(p) == Some(wanted))?
            .ok_or(LinkError::Timeout)?;
        self.ack(packet.sequence())?;
        tracing::debug!(?event, sequence = packet.sequence(), "event received");
        Ok(packet.payload[EVENT_ID_SIZE..].to_vec())
    }

    /// Stream `data` to the peer for `channel` as SEND_DATA commands of at most
    /// `STREAM_CHUNK_SIZE` bytes, each prefixed with the channel id. Nothing is acknowledged:
    /// delivery is best-effort. Returns the number of chunks sent.
    pub fn send_data(&mut self, channel: u16, data: &[u8]) -> Result<usize, LinkError> {
        if data.is_empty() {
            return Err(LinkError::EmptyPayload);
        }
        let channel_bytes = channel.to_le_bytes();
        let mut chunks = 0;
        for chunk in data.chunks(STREAM_CHUNK_SIZE) {
            self.send_packet(
                PacketType::Command,
                command_payload(Command::SendData, &[&channel_bytes, chunk]),
            )?;
            chunks += 1;
            self.transport.delay_ms(INTER_CHUNK_DELAY_MS);
        }
        tracing::debug!(channel, bytes = data.len(), chunks, "data streamed");
        Ok(chunks)
    }

    /// Next valid packet within `timeout_ms`, or None. Peer-side building block.
    pub fn recv_packet(&mut self, timeout_ms: u32) -> Result<Option<Packet>, LinkError> {
        if let Some(p) = self.rx.next_packet() {
            return Ok(Some(p));
        }
        let start = self.transport.now_ms();
        loop {
            let elapsed = self.transport.now_ms().wrapping_sub(start);
            if elapsed >= timeout_ms {
                return Ok(None);
            }
            let slice = (timeout_ms - elapsed).min(self.poll_interval_ms);
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let n = self.transport.receive(&mut buf, slice)?;
            if n > 0 {
                self.rx.push(&buf[..n]);
                if let Some(p) = self.rx.next_packet() {
                    return Ok(Some(p));
                }
            }
        }
    }

    /// Acknowledge the packet that carried `sequence`.
    pub fn ack(&mut self, sequence: u16) -> Result<(), LinkError> {
        self.send_packet(PacketType::Ack, sequence.to_le_bytes().to_vec())?;
        Ok(())
    }

    /// Negative acknowledgment for `sequence`.
    pub fn nack(&mut self, sequence: u16) -> Result<(), LinkError> {
        self.send_packet(PacketType::Nack, sequence.to_le_bytes().to_vec())?;
        Ok(())
    }

    /// Send a RESPONSE correlated with the request that carried `sequence`.
    pub fn respond(&mut self, sequence: u16, payload: &[u8]) -> Result<(), LinkError> {
        let packet = Packet::new(PacketType::Response, sequence, payload.to_vec())?;
        self.take_sequence();
        self.transport.send(&packet.encode())?;
        Ok(())
    }

    fn take_sequence(&mut self) -> u16 {
        let s = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        s
    }

    fn send_packet(&mut self, packet_type: PacketType, payload: Vec<u8>) -> Result<u16, LinkError> {
        let packet = Packet::new(packet_type, self.next_sequence, payload)?;
        let sequence = self.take_sequence();
        self.transport.send(&packet.encode())?;
        Ok(sequence)
    }

    /// Poll until a packet satisfies `accept` or the deadline passes. Everything else is dropped.
    fn wait_for<F>(&mut self, timeout_ms: u32, accept: F) -> Result<Option<Packet>, LinkError>
    where
        F: Fn(&Packet) -> bool,
    {
        let start = self.transport.now_ms();
        loop {
            let elapsed = self.transport.now_ms().wrapping_sub(start);
            if elapsed >= timeout_ms {
                return Ok(None);
            }
            match self.recv_packet((timeout_ms - elapsed).min(self.poll_interval_ms))? {
                Some(p) if accept(&p) => return Ok(Some(p)),
                Some(p) => {
                    tracing::trace!(
                        packet_type = ?p.packet_type(),
                        sequence = p.sequence(),
                        "discarding unexpected packet"
                    );
                }
                None => {}
            }
        }
    }
}

fn command_payload(command: Command, parts: &[&[u8]]) -> Vec<u8> {
    let len = 1 + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut payload = Vec::with_capacity(len);
    payload.push(command as u8);
    for part in parts {
        payload.extend_from_slice(part);
    }
    payload
}

fn is_ack_for(packet: &Packet, sequence: u16) -> bool {
    packet.packet_type() == PacketType::Ack
        && packet.payload.len() >= 2
        && u16::from_le_bytes([packet.payload[0], packet.payload[1]]) == sequence
}

/// Event id carried by an EVENT packet, if it is one.
pub fn event_id_of(packet: &Packet) -> Option<u32> {
    if packet.packet_type() != PacketType::Event || packet.payload.len() < EVENT_ID_SIZE {
        return None;
    }
    let p = &packet.payload;
    Some(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("timed out")]
    Timeout,
    #[error("payload of {0} bytes does not fit in one packet")]
    PayloadTooLarge(usize),
    #[error("empty payload")]
    EmptyPayload,
}
