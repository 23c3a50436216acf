//! Milestone config loader.
//!
//! The milestone is inferred from the first line of the config file:
//! one integer selects FIFO broadcast, two select the perfect-link
//! milestone, three select lattice agreement.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use bobbin_core::codec::MAX_DATAGRAM;
use bobbin_core::host::HostId;

/// What this run of the fleet exercises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Milestone {
    /// Every non-receiver sends the strings `"1"..="messages"` to the
    /// receiver over the perfect link.
    PerfectLink { messages: u64, receiver: HostId },
    /// Every process FIFO-broadcasts the strings `"1"..="messages"`.
    FifoBroadcast { messages: u64 },
    /// Every process proposes one value set per round, in round order.
    LatticeAgreement { proposals: Vec<BTreeSet<i32>> },
}

impl Milestone {
    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as
    /// any of the three milestone shapes.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }

    /// Parse config text; see [`Milestone::load`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the offending line.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = text.lines();
        let first = lines.next().ok_or(ConfigError::Empty)?;
        let fields: Vec<&str> = first.split_whitespace().collect();
        match fields.as_slice() {
            [messages] => {
                let messages = parse_u64(messages, 1)?;
                Ok(Self::FifoBroadcast { messages })
            }
            [messages, receiver] => {
                let messages = parse_u64(messages, 1)?;
                let receiver = parse_u64(receiver, 1)?;
                let receiver = u16::try_from(receiver).map_err(|_| ConfigError::Malformed {
                    line: 1,
                    expected: "receiver id in [1, 128]",
                })?;
                Ok(Self::PerfectLink {
                    messages,
                    receiver: HostId(receiver),
                })
            }
            [rounds, max_size, distinct] => {
                let rounds = parse_u64(rounds, 1)?;
                let max_size = parse_u64(max_size, 1)?;
                let distinct = parse_u64(distinct, 1)?;
                Self::parse_lattice(rounds, max_size, distinct, lines)
            }
            _ => Err(ConfigError::Malformed {
                line: 1,
                expected: "one, two, or three integers",
            }),
        }
    }

    fn parse_lattice<'a>(
        rounds: u64,
        max_size: u64,
        distinct: u64,
        lines: impl Iterator<Item = &'a str>,
    ) -> Result<Self, ConfigError> {
        // The union of a round's proposals holds at most `distinct`
        // values; a decision that cannot fit one datagram would wedge the
        // whole fleet, so refuse it up front.
        let worst_case = usize::try_from(distinct)
            .unwrap_or(usize::MAX)
            .saturating_mul(4)
            .saturating_add(32);
        if worst_case > MAX_DATAGRAM {
            return Err(ConfigError::Invalid(format!(
                "{distinct} distinct values cannot fit a single datagram"
            )));
        }

        let mut proposals = Vec::new();
        for (i, line) in lines.enumerate() {
            let lineno = i + 2;
            if proposals.len() == usize::try_from(rounds).unwrap_or(usize::MAX) {
                if !line.trim().is_empty() {
                    return Err(ConfigError::Malformed {
                        line: lineno,
                        expected: "no content after the last round",
                    });
                }
                continue;
            }
            let mut values = BTreeSet::new();
            for field in line.split_whitespace() {
                let value: i32 = field.parse().map_err(|_| ConfigError::Malformed {
                    line: lineno,
                    expected: "a whitespace-separated set of integers",
                })?;
                values.insert(value);
            }
            if values.len() as u64 > max_size {
                return Err(ConfigError::Invalid(format!(
                    "line {lineno}: proposal has {} values, declared maximum is {max_size}",
                    values.len()
                )));
            }
            proposals.push(values);
        }

        if proposals.len() as u64 != rounds {
            return Err(ConfigError::Invalid(format!(
                "declared {rounds} rounds but found {}",
                proposals.len()
            )));
        }
        Ok(Self::LatticeAgreement { proposals })
    }
}

fn parse_u64(field: &str, line: usize) -> Result<u64, ConfigError> {
    field.parse().map_err(|_| ConfigError::Malformed {
        line,
        expected: "an unsigned integer",
    })
}

/// Failure to load or validate the config file. Fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Empty,
    Malformed { line: usize, expected: &'static str },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Empty => f.write_str("config file is empty"),
            ConfigError::Malformed { line, expected } => {
                write!(f, "config file line {line}: expected {expected}")
            }
            ConfigError::Invalid(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_integer_selects_fifo() {
        assert_eq!(
            Milestone::parse("25\n").unwrap(),
            Milestone::FifoBroadcast { messages: 25 }
        );
    }

    #[test]
    fn two_integers_select_perfect_link() {
        assert_eq!(
            Milestone::parse("10 3\n").unwrap(),
            Milestone::PerfectLink {
                messages: 10,
                receiver: HostId(3)
            }
        );
    }

    #[test]
    fn three_integers_select_lattice() {
        let parsed = Milestone::parse("2 3 5\n1 2 3\n4 5\n").unwrap();
        let Milestone::LatticeAgreement { proposals } = parsed else {
            panic!("expected lattice milestone");
        };
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0], [1, 2, 3].into_iter().collect());
        assert_eq!(proposals[1], [4, 5].into_iter().collect());
    }

    #[test]
    fn empty_proposal_line_is_legal() {
        let parsed = Milestone::parse("1 0 5\n\n").unwrap();
        let Milestone::LatticeAgreement { proposals } = parsed else {
            panic!("expected lattice milestone");
        };
        assert_eq!(proposals, vec![BTreeSet::new()]);
    }

    #[test]
    fn rejects_oversized_proposal() {
        let err = Milestone::parse("1 2 5\n1 2 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_missing_rounds() {
        let err = Milestone::parse("3 2 5\n1 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_file() {
        assert!(matches!(Milestone::parse(""), Err(ConfigError::Empty)));
    }

    #[test]
    fn rejects_garbage_first_line() {
        assert!(matches!(
            Milestone::parse("x y\n"),
            Err(ConfigError::Malformed { line: 1, .. })
        ));
    }
}
