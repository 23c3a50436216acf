//! Bobbin Lattice - rounds of single-shot lattice agreement
//!
//! Each round decides a set that contains the local proposal and is
//! comparable (by inclusion) with every other process's decision for that
//! round. Rounds complete independently but decisions are reported in
//! round order, and an in-flight window throttles proposals so memory
//! stays bounded.
//!
//! The state transitions live in [`LatticeCore`], a pure struct with no
//! I/O; [`LatticeAgreement`] is the actor that wires a core and a
//! [`RoundBuffer`] to the best-effort broadcast layer.

#![warn(clippy::pedantic)]

pub mod agreement;
pub mod core;
pub mod round_buffer;

pub use agreement::{Decision, LatticeAgreement, SEND_WINDOW};
pub use round_buffer::RoundBuffer;
pub use self::core::{Effect, LatticeCore};
