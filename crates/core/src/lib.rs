//! Tick-based networking for a multiplayer arena: bit-packed wire protocol,
//! unreliable transport with an optional stop-and-wait reliable channel,
//! delta-compressed snapshots, clock sync, and an authoritative server /
//! predicting client pair built on top of them.

pub mod bitio;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod prediction;
pub mod protocol;
pub mod reliable;
pub mod server;
pub mod snapshot;
pub mod transport;

pub use client::{ClientSession, ClientState, InterpolatedEntity};
pub use config::{ClientConfig, ServerConfig};
pub use error::{DropCounters, NetError, NetResult};
pub use prediction::{ConsumeResult, JitterBuffer, MovementState, PredictionProfile};
pub use protocol::{
    EntityFlags, EntityState, Message, MessageType, PacketHeader, UserCmd, MAX_ENTITIES, MTU,
};
pub use server::{ConnectionState, ServerSession};
pub use snapshot::{Snapshot, SnapshotHistory};
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport, UdpTransport};
