//! Target descriptors returned by SendTargets discovery

use crate::error::{IscsiError, ScsiResult};
use std::fmt;

/// Well-known iSCSI port
pub const DEFAULT_PORT: u16 = 3260;

/// One network portal through which a target can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
    pub portal_group_tag: Option<String>,
}

impl TargetAddress {
    pub fn new(host: &str, port: u16) -> Self {
        TargetAddress {
            host: host.to_string(),
            port,
            portal_group_tag: None,
        }
    }

    /// Parse `host[:port][,portal-group-tag]` as sent in `TargetAddress=`
    ///
    /// IPv6 hosts are bracketed: `[fe80::1]:3260,1`.
    pub fn parse(value: &str) -> ScsiResult<Self> {
        let (addr, tag) = match value.split_once(',') {
            Some((addr, tag)) => (addr, Some(tag.to_string())),
            None => (value, None),
        };

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                IscsiError::Protocol(format!("Unterminated IPv6 address in '{}'", value))
            })?;
            (host, after.strip_prefix(':'))
        } else {
            match addr.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (addr, None),
            }
        };

        if host.is_empty() {
            return Err(IscsiError::Protocol(format!(
                "Missing host in target address '{}'",
                value
            )));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| {
                IscsiError::Protocol(format!("Invalid port in target address '{}'", value))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(TargetAddress {
            host: host.to_string(),
            port,
            portal_group_tag: tag,
        })
    }

    /// `host:port` form suitable for `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())?;
        if let Some(tag) = &self.portal_group_tag {
            write!(f, ",{}", tag)?;
        }
        Ok(())
    }
}

/// A named target and the portals that serve it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub addresses: Vec<TargetAddress>,
}

impl TargetInfo {
    pub fn new(name: &str, addresses: Vec<TargetAddress>) -> Self {
        TargetInfo {
            name: name.to_string(),
            addresses,
        }
    }
}

impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addresses.first() {
            Some(addr) => write!(f, "iscsi://{}/{}", addr.socket_addr(), self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
