//! Host Addresses and Topology Descriptor
//!
//! Candidate hosts are parsed once from configuration and never change
//! afterwards. Their order is the election priority order.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default MariaDB/MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Replication arrangement of the candidate hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// A single server, no replicas
    Standalone,
    /// One master and read-only replicas, roles declared per host
    Replication,
    /// Every reachable node accepts writes (Galera-style cluster)
    #[serde(alias = "galera", alias = "loadbalance")]
    MultiMaster,
    /// Cloud read-replica cluster, roles discovered from the servers
    #[serde(alias = "cloud-replica")]
    Aurora,
}

impl Topology {
    /// Whether this topology keeps a replica connection next to the master
    pub fn has_replicas(&self) -> bool {
        matches!(self, Topology::Replication | Topology::Aurora)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Standalone => write!(f, "standalone"),
            Topology::Replication => write!(f, "replication"),
            Topology::MultiMaster => write!(f, "multi-master"),
            Topology::Aurora => write!(f, "aurora"),
        }
    }
}

/// Role declared for a host in the host list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Master,
    Slave,
}

impl FromStr for HostType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" | "primary" => Ok(HostType::Master),
            "slave" | "replica" | "secondary" => Ok(HostType::Slave),
            other => Err(Error::InvalidHost(format!("unknown host type '{}'", other))),
        }
    }
}

/// One server endpoint
///
/// Equality and hashing only consider `(host, port)`, the type tag is
/// informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_type: Option<HostType>,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            host_type: None,
        }
    }

    pub fn with_type(mut self, host_type: HostType) -> Self {
        self.host_type = Some(host_type);
        self
    }

    /// Address suitable for a socket connect
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse an ordered host list for a topology
    ///
    /// For replication, untagged hosts default to master for the first entry
    /// and slave for the others.
    pub fn parse_list(hosts: &[String], topology: Topology) -> Result<Vec<HostAddress>> {
        let mut parsed = hosts
            .iter()
            .map(|h| h.parse::<HostAddress>())
            .collect::<Result<Vec<_>>>()?;

        if topology == Topology::Replication {
            let any_master = parsed
                .iter()
                .any(|h| h.host_type == Some(HostType::Master));
            for (idx, host) in parsed.iter_mut().enumerate() {
                if host.host_type.is_none() {
                    host.host_type = if idx == 0 && !any_master {
                        Some(HostType::Master)
                    } else {
                        Some(HostType::Slave)
                    };
                }
            }
        }

        Ok(parsed)
    }
}

impl PartialEq for HostAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for HostAddress {}

impl Hash for HostAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_address())
    }
}

/// Accepts `host`, `host:port`, `[v6]:port`, each optionally followed by
/// `?type=master|slave`
impl FromStr for HostAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, params) = match s.split_once('?') {
            Some((addr, params)) => (addr, Some(params)),
            None => (s, None),
        };

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidHost(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(Error::InvalidHost(s.to_string())),
            };
            (host, port)
        } else {
            match addr.rsplit_once(':') {
                Some((host, p)) => (host, parse_port(p, s)?),
                None => (addr, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidHost(s.to_string()));
        }

        let mut address = HostAddress::new(host, port);
        if let Some(params) = params {
            for param in params.split('&').filter(|p| !p.is_empty()) {
                match param.split_once('=') {
                    Some(("type", value)) => address.host_type = Some(value.parse()?),
                    _ => return Err(Error::InvalidHost(s.to_string())),
                }
            }
        }

        Ok(address)
    }
}

fn parse_port(port: &str, original: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::InvalidHost(original.to_string()))
}
