//! Scenario scripts.
//!
//! Two line-oriented formats drive the simulator. `#` starts a comment and
//! blank lines are skipped in both.
//!
//! Topology:
//!
//! ```text
//! 3          # server count
//! N1 10      # <id> <tokens>, one line per server
//! N2 0
//! N3 0
//! N1 N2      # <src> <dest>, one line per link
//! N2 N3
//! N3 N1
//! ```
//!
//! Events:
//!
//! ```text
//! send N1 N2 3     # transfer 3 tokens from N1 to N2
//! snapshot N1      # trigger a new snapshot on N1
//! tick             # advance one tick
//! tick 5           # advance five ticks
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::protocol::ServerId;

use super::error::ScriptError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Servers with their initial balances, in file order.
    pub servers: Vec<(ServerId, u64)>,
    /// Directed links, in file order.
    pub links: Vec<(ServerId, ServerId)>,
}

impl Topology {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut lines = significant_lines(text);

        let (line, fields) = lines.next().ok_or(ScriptError::MissingServerCount)?;
        let count: usize = match fields.as_slice() {
            [count] => parse_number(line, count, "server count")?,
            _ => return Err(ScriptError::parse(line, "expected a single server count")),
        };

        let mut servers = Vec::with_capacity(count);
        let mut known = HashSet::new();
        let mut total: u64 = 0;
        for _ in 0..count {
            let (line, fields) = lines.next().ok_or(ScriptError::MissingServers {
                expected: count,
                found: servers.len(),
            })?;
            let (id, tokens) = match fields.as_slice() {
                [id, tokens] => (ServerId::from(*id), parse_number(line, tokens, "token count")?),
                _ => return Err(ScriptError::parse(line, "expected `<id> <tokens>`")),
            };
            if !known.insert(id.clone()) {
                return Err(ScriptError::parse(line, format!("server {} declared twice", id)));
            }
            total = total.checked_add(tokens).ok_or_else(|| {
                ScriptError::parse(line, format!("total token count overflows at server {}", id))
            })?;
            servers.push((id, tokens));
        }

        let mut links = Vec::new();
        for (line, fields) in lines {
            let (src, dest) = match fields.as_slice() {
                [src, dest] => (ServerId::from(*src), ServerId::from(*dest)),
                _ => return Err(ScriptError::parse(line, "expected `<src> <dest>`")),
            };
            for id in [&src, &dest] {
                if !known.contains(id) {
                    return Err(ScriptError::parse(line, format!("unknown server {}", id)));
                }
            }
            links.push((src, dest));
        }

        Ok(Topology { servers, links })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        Self::parse(&read_file(path.as_ref())?)
    }

    /// Sum of initial balances. `parse` rejects topologies whose total
    /// does not fit in a `u64`; hand-built ones saturate.
    pub fn total_tokens(&self) -> u64 {
        self.servers
            .iter()
            .fold(0u64, |acc, (_, tokens)| acc.saturating_add(*tokens))
    }
}

impl FromStr for Topology {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One step of an event script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    Send {
        src: ServerId,
        dest: ServerId,
        amount: u64,
    },
    Snapshot {
        server: ServerId,
    },
    Tick(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub events: Vec<ScriptEvent>,
}

impl Script {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut events = Vec::new();
        for (line, fields) in significant_lines(text) {
            let event = match fields.as_slice() {
                ["send", src, dest, amount] => ScriptEvent::Send {
                    src: ServerId::from(*src),
                    dest: ServerId::from(*dest),
                    amount: parse_number(line, amount, "token amount")?,
                },
                ["snapshot", server] => ScriptEvent::Snapshot {
                    server: ServerId::from(*server),
                },
                ["tick"] => ScriptEvent::Tick(1),
                ["tick", n] => ScriptEvent::Tick(parse_number(line, n, "tick count")?),
                [directive, ..] => {
                    return Err(ScriptError::parse(
                        line,
                        format!("unrecognized directive `{}`", directive),
                    ))
                }
                [] => continue,
            };
            events.push(event);
        }
        Ok(Script { events })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        Self::parse(&read_file(path.as_ref())?)
    }
}

impl FromStr for Script {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Non-empty lines with comments stripped, as (1-based line number, fields).
fn significant_lines(text: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    text.lines().enumerate().filter_map(|(idx, raw)| {
        let content = raw.split('#').next().unwrap_or("");
        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.is_empty() {
            None
        } else {
            Some((idx + 1, fields))
        }
    })
}

fn parse_number<T: FromStr>(line: usize, field: &str, what: &str) -> Result<T, ScriptError> {
    field
        .parse()
        .map_err(|_| ScriptError::parse(line, format!("invalid {} `{}`", what, field)))
}

fn read_file(path: &Path) -> Result<String, ScriptError> {
    fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: &str = "\
# three servers in a ring
3
N1 10
N2 0
N3 0

N1 N2
N2 N3
N3 N1  # closes the ring
";

    #[test]
    fn test_parse_topology() {
        let topology = Topology::parse(RING).unwrap();
        assert_eq!(topology.servers.len(), 3);
        assert_eq!(topology.servers[0], (ServerId::from("N1"), 10));
        assert_eq!(
            topology.links,
            vec![
                (ServerId::from("N1"), ServerId::from("N2")),
                ("N2".into(), "N3".into()),
                ("N3".into(), "N1".into()),
            ]
        );
        assert_eq!(topology.total_tokens(), 10);
    }

    #[test]
    fn test_topology_errors_carry_line_numbers() {
        let err = Topology::parse("2\nN1 1\nN2 x\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { line: 3, .. }), "{:?}", err);

        let err = Topology::parse("2\nN1 1\nN2 1\nN1 N9\n").unwrap_err();
        assert!(err.to_string().contains("unknown server N9"));

        let err = Topology::parse("3\nN1 1\n").unwrap_err();
        assert!(matches!(err, ScriptError::MissingServers { expected: 3, found: 1 }));

        assert!(matches!(
            Topology::parse("# nothing\n").unwrap_err(),
            ScriptError::MissingServerCount
        ));
    }

    #[test]
    fn test_topology_total_must_fit_u64() {
        let err = Topology::parse("2\nA 18446744073709551615\nB 1\nA B\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { line: 3, .. }), "{:?}", err);
        assert!(err.to_string().contains("overflows"));

        let topology = Topology::parse("2\nA 18446744073709551614\nB 1\nA B\n").unwrap();
        assert_eq!(topology.total_tokens(), u64::MAX);

        let hand_built = Topology {
            servers: vec![("A".into(), u64::MAX), ("B".into(), 1)],
            links: Vec::new(),
        };
        assert_eq!(hand_built.total_tokens(), u64::MAX);
    }

    #[test]
    fn test_parse_events() {
        let script: Script = "send N1 N2 3\nsnapshot N1\ntick\ntick 4\n".parse().unwrap();
        assert_eq!(
            script.events,
            vec![
                ScriptEvent::Send {
                    src: "N1".into(),
                    dest: "N2".into(),
                    amount: 3,
                },
                ScriptEvent::Snapshot { server: "N1".into() },
                ScriptEvent::Tick(1),
                ScriptEvent::Tick(4),
            ]
        );
    }

    #[test]
    fn test_unknown_directive_rejected() {
        let err = Script::parse("tick\nexplode N1\n").unwrap_err();
        assert_eq!(err.to_string(), "line 2: unrecognized directive `explode`");
    }

    #[test]
    fn test_missing_file() {
        let err = Script::load("/nonexistent/tokensnap/events.txt").unwrap_err();
        assert!(matches!(err, ScriptError::Io { .. }));
    }
}
