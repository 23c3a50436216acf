//! Host identities and the static host table.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// Identifier of a process in the fleet. Ids are distinct and contiguous
/// from 1, with at most [`HostId::MAX_HOSTS`] processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub u16);

impl HostId {
    /// Largest supported fleet size.
    pub const MAX_HOSTS: u16 = 128;
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One process: its id and its UDP endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub addr: SocketAddr,
}

/// The static membership, fixed at startup.
///
/// Holds the ordered host list plus an id-to-address map. Tolerates
/// f < N/2 crash failures; [`HostTable::majority`] is the quorum size
/// used by both the uniform broadcast and the agreement layer.
#[derive(Clone, Debug)]
pub struct HostTable {
    hosts: Vec<Host>,
    addrs: HashMap<HostId, SocketAddr>,
}

impl HostTable {
    /// Build a table from a host list, validating the id space.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty, an id is out of `[1, 128]`,
    /// duplicated, or the ids are not contiguous from 1.
    pub fn new(mut hosts: Vec<Host>) -> Result<Self, HostsError> {
        if hosts.is_empty() {
            return Err(HostsError::Empty);
        }
        hosts.sort_by_key(|h| h.id);
        let mut addrs = HashMap::with_capacity(hosts.len());
        for (i, host) in hosts.iter().enumerate() {
            let id = host.id;
            if id.0 == 0 || id.0 > HostId::MAX_HOSTS {
                return Err(HostsError::IdOutOfRange(id.0));
            }
            if addrs.insert(id, host.addr).is_some() {
                return Err(HostsError::DuplicateId(id.0));
            }
            let expected = u16::try_from(i + 1).map_err(|_| HostsError::IdOutOfRange(id.0))?;
            if id.0 != expected {
                return Err(HostsError::NotContiguous(id.0, expected));
            }
        }
        Ok(Self { hosts, addrs })
    }

    /// Load the table from a hosts file: one `<id> <ip-or-hostname> <port>`
    /// per line, whitespace-separated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a line fails to parse,
    /// a hostname does not resolve to an IPv4 address, or the id space is
    /// invalid (see [`HostTable::new`]).
    pub fn load(path: &Path) -> Result<Self, HostsError> {
        let file = File::open(path).map_err(HostsError::Io)?;
        Self::parse(BufReader::new(file))
    }

    /// Parse a hosts file from any buffered reader.
    ///
    /// # Errors
    ///
    /// See [`HostTable::load`].
    pub fn parse(reader: impl BufRead) -> Result<Self, HostsError> {
        let mut hosts = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(HostsError::Io)?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(name), Some(port), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(HostsError::Malformed { line: lineno + 1 });
            };
            let id: u16 = id
                .parse()
                .map_err(|_| HostsError::Malformed { line: lineno + 1 })?;
            let port: u16 = port
                .parse()
                .map_err(|_| HostsError::Malformed { line: lineno + 1 })?;
            let addr = resolve(name, port)?;
            hosts.push(Host {
                id: HostId(id),
                addr,
            });
        }
        Self::new(hosts)
    }

    /// Number of processes N.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Quorum size: ⌊N/2⌋ + 1.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.hosts.len() / 2 + 1
    }

    #[must_use]
    pub fn contains(&self, id: HostId) -> bool {
        self.addrs.contains_key(&id)
    }

    #[must_use]
    pub fn addr_of(&self, id: HostId) -> Option<SocketAddr> {
        self.addrs.get(&id).copied()
    }

    /// Hosts in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    /// All ids in order, including the local one.
    pub fn ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.iter().map(|h| h.id)
    }
}

fn resolve(name: &str, port: u16) -> Result<SocketAddr, HostsError> {
    (name, port)
        .to_socket_addrs()
        .map_err(|_| HostsError::Unresolvable(name.to_owned()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| HostsError::Unresolvable(name.to_owned()))
}

/// Failure to load or validate the host table. Fatal at startup.
#[derive(Debug)]
pub enum HostsError {
    Io(io::Error),
    Malformed { line: usize },
    Unresolvable(String),
    Empty,
    IdOutOfRange(u16),
    DuplicateId(u16),
    NotContiguous(u16, u16),
}

impl fmt::Display for HostsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostsError::Io(e) => write!(f, "failed to read hosts file: {e}"),
            HostsError::Malformed { line } => {
                write!(f, "hosts file line {line}: expected `<id> <host> <port>`")
            }
            HostsError::Unresolvable(name) => {
                write!(f, "host {name:?} does not resolve to an IPv4 address")
            }
            HostsError::Empty => f.write_str("hosts file contains no hosts"),
            HostsError::IdOutOfRange(id) => write!(f, "host id {id} outside [1, 128]"),
            HostsError::DuplicateId(id) => write!(f, "duplicate host id {id}"),
            HostsError::NotContiguous(id, expected) => {
                write!(f, "host ids must be contiguous from 1: found {id}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for HostsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_well_formed_hosts() {
        let table = HostTable::parse(Cursor::new("1 127.0.0.1 11001\n2 127.0.0.1 11002\n"))
            .expect("should parse");
        assert_eq!(table.len(), 2);
        assert_eq!(table.majority(), 2);
        assert_eq!(
            table.addr_of(HostId(2)),
            Some("127.0.0.1:11002".parse().unwrap())
        );
    }

    #[test]
    fn skips_blank_lines() {
        let table =
            HostTable::parse(Cursor::new("1 127.0.0.1 11001\n\n2 127.0.0.1 11002\n")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn rejects_gap_in_ids() {
        let err = HostTable::parse(Cursor::new("1 127.0.0.1 11001\n3 127.0.0.1 11003\n"))
            .unwrap_err();
        assert!(matches!(err, HostsError::NotContiguous(3, 2)));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = HostTable::parse(Cursor::new("1 127.0.0.1 11001\n1 127.0.0.1 11002\n"))
            .unwrap_err();
        assert!(matches!(err, HostsError::DuplicateId(1)));
    }

    #[test]
    fn rejects_zero_id() {
        let err = HostTable::parse(Cursor::new("0 127.0.0.1 11001\n")).unwrap_err();
        assert!(matches!(err, HostsError::IdOutOfRange(0)));
    }

    #[test]
    fn rejects_trailing_fields() {
        let err = HostTable::parse(Cursor::new("1 127.0.0.1 11001 extra\n")).unwrap_err();
        assert!(matches!(err, HostsError::Malformed { line: 1 }));
    }

    #[test]
    fn majority_of_one_is_one() {
        let table = HostTable::parse(Cursor::new("1 127.0.0.1 11001\n")).unwrap();
        assert_eq!(table.majority(), 1);
    }

    #[test]
    fn majority_is_floor_half_plus_one() {
        let lines: String = (1..=5)
            .map(|i| format!("{i} 127.0.0.1 {}\n", 11000 + i))
            .collect();
        let table = HostTable::parse(Cursor::new(lines)).unwrap();
        assert_eq!(table.majority(), 3);
    }
}
