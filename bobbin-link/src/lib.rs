//! Bobbin Link - point-to-point delivery over a lossy datagram network
//!
//! Two layers. The [`FairLossLink`] is a bound UDP endpoint: best-effort
//! send, blocking receive, no retries, no headers of its own. The
//! [`PerfectLink`] turns it into exactly-once delivery per `(sender, seq)`
//! with stubborn retransmission and receive-side deduplication.

#![warn(clippy::pedantic)]

pub mod fair_loss;
pub mod perfect_link;

pub use fair_loss::FairLossLink;
pub use perfect_link::{LinkStats, PerfectLink};
