//! Peer side of the link: acknowledge commands and events, answer PING and
//! GET_STATUS, and account streamed SEND_DATA bytes per channel.

use std::collections::BTreeMap;

use crate::link::{event_id_of, Link, LinkError, CHANNEL_ID_SIZE};
use crate::protocol::{Command, EventId, PacketType, StatusCode};
use crate::transport::Transport;

/// What the responder did with one received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A command was acknowledged (and answered, for PING / GET_STATUS).
    Command { command: Command, sequence: u16, args: Vec<u8> },
    /// A streamed chunk for `channel` arrived. Not acknowledged.
    Data { channel: u16, bytes: Vec<u8> },
    /// An event was acknowledged. `id` is the raw wire id.
    Event { id: u32, sequence: u16, data: Vec<u8> },
    /// Command with an unknown opcode; answered with NACK.
    Rejected { sequence: u16, opcode: u8 },
    /// ACK / NACK / RESPONSE addressed to us, or an empty command; nothing to do.
    Ignored { packet_type: PacketType, sequence: u16 },
}

/// Serves the peer side of a `Link`.
pub struct Responder<T: Transport> {
    link: Link<T>,
    packets_seen: u32,
    stream_bytes: BTreeMap<u16, u64>,
}

impl<T: Transport> Responder<T> {
    pub fn new(link: Link<T>) -> Self {
        Self {
            link,
            packets_seen: 0,
            stream_bytes: BTreeMap::new(),
        }
    }

    pub fn link_mut(&mut self) -> &mut Link<T> {
        &mut self.link
    }

    pub fn into_link(self) -> Link<T> {
        self.link
    }

    /// Valid packets handled so far.
    pub fn packets_seen(&self) -> u32 {
        self.packets_seen
    }

    /// Streamed bytes received for `channel`.
    pub fn stream_bytes(&self, channel: u16) -> u64 {
        self.stream_bytes.get(&channel).copied().unwrap_or(0)
    }

    /// Handle at most one packet, waiting up to `timeout_ms` for it.
    pub fn serve_once(&mut self, timeout_ms: u32) -> Result<Option<PeerEvent>, LinkError> {
        let Some(packet) = self.link.recv_packet(timeout_ms)? else {
            return Ok(None);
        };
        self.packets_seen = self.packets_seen.wrapping_add(1);
        let sequence = packet.sequence();

        let event = match packet.packet_type() {
            PacketType::Command => {
                let Some((&opcode, args)) = packet.payload.split_first() else {
                    return Ok(Some(PeerEvent::Ignored {
                        packet_type: PacketType::Command,
                        sequence,
                    }));
                };
                match Command::try_from(opcode) {
                    Ok(Command::SendData) if args.len() >= CHANNEL_ID_SIZE => {
                        let channel = u16::from_le_bytes([args[0], args[1]]);
                        let bytes = args[CHANNEL_ID_SIZE..].to_vec();
                        *self.stream_bytes.entry(channel).or_insert(0) += bytes.len() as u64;
                        tracing::trace!(channel, len = bytes.len(), "stream chunk");
                        PeerEvent::Data { channel, bytes }
                    }
                    Ok(command) => {
                        self.link.ack(sequence)?;
                        match command {
                            Command::Ping => {
                                self.link.respond(sequence, &[StatusCode::Success as u8])?;
                            }
                            Command::GetStatus => {
                                let mut status = vec![StatusCode::Success as u8];
                                status.extend_from_slice(&self.packets_seen.to_le_bytes());
                                self.link.respond(sequence, &status)?;
                            }
                            _ => {}
                        }
                        tracing::debug!(?command, sequence, "command acknowledged");
                        PeerEvent::Command {
                            command,
                            sequence,
                            args: args.to_vec(),
                        }
                    }
                    Err(opcode) => {
                        self.link.nack(sequence)?;
                        tracing::warn!(opcode, sequence, "unknown command rejected");
                        PeerEvent::Rejected { sequence, opcode }
                    }
                }
            }
            PacketType::Event => match event_id_of(&packet) {
                Some(id) => {
                    self.link.ack(sequence)?;
                    tracing::debug!(event = ?EventId::from_u32(id), id, sequence, "event acknowledged");
                    PeerEvent::Event {
                        id,
                        sequence,
                        data: packet.payload[4..].to_vec(),
                    }
                }
                None => PeerEvent::Ignored {
                    packet_type: PacketType::Event,
                    sequence,
                },
            },
            other => PeerEvent::Ignored {
                packet_type: other,
                sequence,
            },
        };
        Ok(Some(event))
    }
}
