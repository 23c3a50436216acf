//! Bobbin Broadcast - one-to-many delivery layers
//!
//! Three layers of increasing strength over the perfect link:
//!
//! - [`BestEffortBroadcast`]: one perfect-link send per destination,
//!   including self. Stateless.
//! - [`UniformReliableBroadcast`]: majority-ack relaying. If any process
//!   delivers an instance, every correct process eventually does.
//! - [`FifoBroadcast`]: uniform reliable broadcast plus per-source FIFO
//!   order via a re-sequencing buffer.

#![warn(clippy::pedantic)]

pub mod beb;
pub mod fifo;
pub mod urb;

pub use beb::BestEffortBroadcast;
pub use fifo::{FifoBroadcast, ReorderBuffer};
pub use urb::{UniformReliableBroadcast, UrbCore, UrbStep};
