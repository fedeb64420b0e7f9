//! Port Specification Parsing
//!
//! Turns a string such as `"80,25565:25566"` into an ordered list of
//! [`PortPair`]s. The meaning of each side depends on the role:
//!
//! | role   | `src`                  | `dest`                    |
//! |--------|------------------------|---------------------------|
//! | server | real backend port      | virtual label on the link |
//! | client | remote virtual label   | local bind port           |

use std::collections::HashMap;

use crate::error::{PortLinkError, Result};

/// One `src:dest` entry of a port specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub src: String,
    pub dest: String,
}

impl PortPair {
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
        }
    }

    /// A pair whose source and destination are the same value.
    pub fn same(port: impl Into<String>) -> Self {
        let port = port.into();
        Self {
            src: port.clone(),
            dest: port,
        }
    }

    /// `src` as a backend port. Port 0 is never a valid dial target.
    pub fn src_port(&self) -> Result<u16> {
        match self.src.parse::<u16>() {
            Ok(0) | Err(_) => Err(PortLinkError::InvalidPort(self.src.clone())),
            Ok(port) => Ok(port),
        }
    }

    /// `dest` as a local bind port. Port 0 lets the OS pick.
    pub fn dest_port(&self) -> Result<u16> {
        self.dest
            .parse::<u16>()
            .map_err(|_| PortLinkError::InvalidPort(self.dest.clone()))
    }

    /// Whether the pair renames the port rather than passing it through.
    pub fn is_remapped(&self) -> bool {
        self.src != self.dest
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_remapped() {
            write!(f, "{}:{}", self.src, self.dest)
        } else {
            write!(f, "{}", self.src)
        }
    }
}

/// Parse a comma separated port specification.
///
/// Tokens are trimmed and empty tokens are skipped. `A:B` yields
/// `src = A, dest = B`; a bare `A` yields `src = dest = A`. Any destination
/// seen twice is a conflict. Output order follows input order.
pub fn parse_ports(spec: &str) -> Result<Vec<PortPair>> {
    let mut pairs = Vec::new();
    // dest -> src of the first pair that claimed it
    let mut used: HashMap<String, String> = HashMap::new();

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let pair = parse_token(token)?;

        if let Some(original) = used.get(&pair.dest) {
            return Err(PortLinkError::PortConflict {
                dest: pair.dest,
                src: pair.src,
                original: original.clone(),
            });
        }
        used.insert(pair.dest.clone(), pair.src.clone());

        pairs.push(pair);
    }

    Ok(pairs)
}

fn parse_token(token: &str) -> Result<PortPair> {
    let mut parts = token.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(port), None, None) => Ok(PortPair::same(port)),
        (Some(src), Some(dest), None) => {
            let (src, dest) = (src.trim(), dest.trim());
            if src.is_empty() || dest.is_empty() {
                return Err(PortLinkError::InvalidPortFormat(token.to_string()));
            }
            Ok(PortPair::new(src, dest))
        }
        _ => Err(PortLinkError::InvalidPortFormat(token.to_string())),
    }
}
