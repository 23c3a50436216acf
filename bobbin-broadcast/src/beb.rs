//! Best-effort broadcast: a perfect-link fanout.

use bytes::Bytes;

use bobbin_core::host::{HostId, HostTable};
use bobbin_link::PerfectLink;

/// Stateless fanout over the perfect link. Validity, no-duplication and
/// no-creation all follow from the link's guarantees; deliveries are the
/// link's delivery channel, passed through unchanged.
#[derive(Clone)]
pub struct BestEffortBroadcast {
    link: PerfectLink,
    hosts: HostTable,
}

impl BestEffortBroadcast {
    #[must_use]
    pub fn new(link: PerfectLink, hosts: HostTable) -> Self {
        Self { link, hosts }
    }

    /// One link send per host, self included. `Bytes` payloads make the
    /// fanout clones reference-counted.
    pub async fn broadcast(&self, payload: Bytes) {
        for id in self.hosts.ids() {
            self.link.send(payload.clone(), id).await;
        }
    }

    /// Point-to-point passthrough, used by layers that reply to a single
    /// peer rather than the whole fleet.
    pub async fn send(&self, payload: Bytes, dest: HostId) {
        self.link.send(payload, dest).await;
    }

    #[must_use]
    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }
}
