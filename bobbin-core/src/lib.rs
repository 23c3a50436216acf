//! Bobbin Core - shared types for the bobbin messaging stack
//!
//! This crate provides the types used by every layer of the stack: host
//! identities and the static host table, the three frame types (transport,
//! broadcast, proposal), and the fixed-layout little-endian wire codec.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod frame;
pub mod host;

pub use codec::{MAX_DATAGRAM, WireError};
pub use frame::{BroadcastFrame, FrameKind, ProposalFrame, ProposalKind, TransportFrame};
pub use host::{Host, HostId, HostTable, HostsError};
