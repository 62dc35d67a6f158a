//! Forward and listen target specs.
//!
//! Target names are alphanumeric plus underscore, case-insensitive. A
//! forward spec maps a name to a TCP destination or port range; a listen
//! spec binds a local address to a (possibly offset) remote target name.

use std::collections::HashMap;
use std::fmt;

use crate::error::WhetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Tcp,
    Listener,
}

/// A server-side destination: `name=host:port` or `name=host:low-high`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub name: String,
    pub kind: TargetKind,
    pub host: String,
    pub start_port: u16,
    pub port_count: u16,
}

impl ForwardTarget {
    pub fn parse(spec: &str) -> Result<Self, WhetError> {
        let (name, rest) = spec
            .split_once('=')
            .ok_or_else(|| invalid(spec, "missing '='"))?;
        let name = normalize_name(name)
            .ok_or_else(|| invalid(spec, "target name must be alphanumeric or underscore"))?;
        let (host, ports) = rest
            .split_once(':')
            .ok_or_else(|| invalid(spec, "missing ':' between host and port"))?;
        if host.is_empty() {
            return Err(invalid(spec, "empty host"));
        }

        let (low, high) = match ports.split_once('-') {
            Some((low, high)) => (parse_port(spec, low)?, parse_port(spec, high)?),
            None => {
                let port = parse_port(spec, ports)?;
                (port, port)
            }
        };
        if low > high {
            return Err(invalid(spec, "port range low exceeds high"));
        }

        Ok(Self {
            name,
            kind: TargetKind::Tcp,
            host: host.to_owned(),
            start_port: low,
            port_count: high - low + 1,
        })
    }

    /// Maps a port offset inside the range to a dialable `host:port`.
    pub fn resolve(&self, offset: u16) -> Result<String, WhetError> {
        if offset >= self.port_count {
            return Err(WhetError::Target(format!(
                "offset {offset} out of range for target {}",
                self.name
            )));
        }
        Ok(format!("{}:{}", self.host, self.start_port + offset))
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port_count == 1 {
            write!(f, "{}={}:{}", self.name, self.host, self.start_port)
        } else {
            write!(
                f,
                "{}={}:{}-{}",
                self.name,
                self.host,
                self.start_port,
                self.start_port + self.port_count - 1
            )
        }
    }
}

/// A client-side listen spec: `name[-offset]=local_host:local_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenTarget {
    pub target_name: String,
    pub port_offset: Option<u16>,
    pub local_host: String,
    pub local_port: u16,
}

impl ListenTarget {
    pub fn parse(spec: &str) -> Result<Self, WhetError> {
        let (name_part, rest) = spec
            .split_once('=')
            .ok_or_else(|| invalid(spec, "missing '='"))?;
        let (host, port) = rest
            .split_once(':')
            .ok_or_else(|| invalid(spec, "missing ':' between host and port"))?;
        if host.is_empty() {
            return Err(invalid(spec, "empty local host"));
        }
        let local_port = parse_port(spec, port)?;

        let (name, port_offset) = match name_part.split_once('-') {
            Some((name, offset)) => {
                let offset = offset
                    .parse::<u16>()
                    .map_err(|_| invalid(spec, "non-numeric port offset"))?;
                (name, Some(offset))
            }
            None => (name_part, None),
        };
        let target_name = normalize_name(name)
            .ok_or_else(|| invalid(spec, "target name must be alphanumeric or underscore"))?;

        Ok(Self {
            target_name,
            port_offset,
            local_host: host.to_owned(),
            local_port,
        })
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// The path suffix used when signaling: `name` or `name-offset`.
    pub fn path_suffix(&self) -> String {
        match self.port_offset {
            Some(offset) => format!("{}-{}", self.target_name, offset),
            None => self.target_name.clone(),
        }
    }
}

pub fn parse_forward_targets(specs: &[String]) -> Result<HashMap<String, ForwardTarget>, WhetError> {
    let mut targets = HashMap::with_capacity(specs.len());
    for spec in specs {
        let target = ForwardTarget::parse(spec)?;
        targets.insert(target.name.clone(), target);
    }
    Ok(targets)
}

pub fn parse_listen_targets(specs: &[String]) -> Result<Vec<ListenTarget>, WhetError> {
    specs.iter().map(|spec| ListenTarget::parse(spec)).collect()
}

/// Lowercases a target name, rejecting anything outside `[A-Za-z0-9_]`.
pub(crate) fn normalize_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        .then(|| name.to_ascii_lowercase())
}

fn parse_port(spec: &str, value: &str) -> Result<u16, WhetError> {
    value
        .parse::<u16>()
        .map_err(|_| invalid(spec, "non-numeric or out-of-range port"))
}

fn invalid(spec: &str, reason: &str) -> WhetError {
    WhetError::Config(format!("invalid target spec {spec:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_port() {
        let target = ForwardTarget::parse("ssh=localhost:22").unwrap();
        assert_eq!(target.name, "ssh");
        assert_eq!(target.host, "localhost");
        assert_eq!(target.start_port, 22);
        assert_eq!(target.port_count, 1);
    }

    #[test]
    fn parses_port_range() {
        let target = ForwardTarget::parse("remoterange=192.168.0.33:10000-10010").unwrap();
        assert_eq!(target.start_port, 10000);
        assert_eq!(target.port_count, 11);
    }

    #[test]
    fn names_are_case_insensitive() {
        let target = ForwardTarget::parse("SSH_Box=localhost:22").unwrap();
        assert_eq!(target.name, "ssh_box");
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(ForwardTarget::parse("noequals").is_err());
        assert!(ForwardTarget::parse("name=noport").is_err());
        assert!(ForwardTarget::parse("name=host:abc").is_err());
        assert!(ForwardTarget::parse("name=host:9000-8000").is_err());
        assert!(ForwardTarget::parse("bad name=host:80").is_err());
        assert!(ForwardTarget::parse("bad-name=host:80").is_err());
        assert!(ForwardTarget::parse("=host:80").is_err());
    }

    #[test]
    fn display_round_trips() {
        for spec in ["ssh=localhost:22", "range=127.0.0.1:10000-10010"] {
            let target = ForwardTarget::parse(spec).unwrap();
            assert_eq!(target.to_string(), spec);
            assert_eq!(ForwardTarget::parse(&target.to_string()).unwrap(), target);
        }
        // A degenerate range flattens to a single port.
        let target = ForwardTarget::parse("one=host:8080-8080").unwrap();
        assert_eq!(target.to_string(), "one=host:8080");
    }

    #[test]
    fn resolves_offsets_within_range() {
        let single = ForwardTarget::parse("one=127.0.0.1:9999").unwrap();
        assert_eq!(single.resolve(0).unwrap(), "127.0.0.1:9999");
        assert!(single.resolve(1).is_err());

        let range = ForwardTarget::parse("range=host:10000-10010").unwrap();
        assert_eq!(range.resolve(10).unwrap(), "host:10010");
        assert!(range.resolve(11).is_err());
    }

    #[test]
    fn parses_listen_specs() {
        let listen = ListenTarget::parse("ssh=127.0.0.1:8822").unwrap();
        assert_eq!(listen.target_name, "ssh");
        assert_eq!(listen.port_offset, None);
        assert_eq!(listen.local_addr(), "127.0.0.1:8822");
        assert_eq!(listen.path_suffix(), "ssh");

        let listen = ListenTarget::parse("range-10=0.0.0.0:8824").unwrap();
        assert_eq!(listen.target_name, "range");
        assert_eq!(listen.port_offset, Some(10));
        assert_eq!(listen.path_suffix(), "range-10");
    }

    #[test]
    fn rejects_malformed_listen_specs() {
        assert!(ListenTarget::parse("ssh").is_err());
        assert!(ListenTarget::parse("ssh=hostonly").is_err());
        assert!(ListenTarget::parse("range-x=host:80").is_err());
        assert!(ListenTarget::parse("a-1-2=host:80").is_err());
    }
}
