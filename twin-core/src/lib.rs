//! Communication core for a dual-controller peripheral.
//! Packet protocol over an injected byte transport, channel registry and arbitration,
//! and a tick-driven transfer scheduler. Host-driven: no threads or sockets of its own.

pub mod integrity;
pub mod protocol;
pub mod transport;
pub mod wire;

pub mod link;
pub mod peer;

pub mod arbiter;
pub mod config;
pub mod core;
pub mod registry;
pub mod relay;
pub mod scheduler;

pub mod ffi;

pub use arbiter::{best_channel, ArbiterError, Policy};
pub use config::{Config, ConfigError};
pub use crate::core::TwinCore;
pub use link::{Link, LinkError};
pub use peer::{PeerEvent, Responder};
pub use protocol::{Command, CustomEvent, EventId, PacketType, StatusCode, PROTOCOL_VERSION};
pub use registry::{ChannelKind, ChannelSink, ChannelStatus, Registry};
pub use relay::{RelaySink, SharedLink};
pub use scheduler::{Scheduler, SchedulerError, TickReport};
pub use transport::{loopback_pair, ByteRing, Clock, LoopbackTransport, SystemClock, Transport, TransportError};
pub use wire::{decode_packet, Deframer, Packet, WireError};
