use std::fmt;

use serde::{Deserialize, Serialize};

/// One established TCP connection taken from the connection table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Connection {
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    /// Socket cookie reported by `ss -e`, without the `sk:` prefix.
    pub cookie: String,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (sk:{})",
            join_host_port(&self.local_ip, self.local_port),
            join_host_port(&self.remote_ip, self.remote_port),
            self.cookie
        )
    }
}

/// Formats `ip:port`, bracketing IPv6 literals the way `ss` prints them.
pub fn join_host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

/// Why a connection-table line did not produce a [`Connection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    IncompleteLine { fields: usize },
    NotEstablishedTcp,
    MissingSeparator(String),
    IgnoredAddress(String),
    InvalidAddress(String),
    InvalidPort(String),
    NoCookie,
}

impl ParseError {
    /// Short stable label, used when counting skipped lines.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::IncompleteLine { .. } => "incomplete_line",
            ParseError::NotEstablishedTcp => "not_established_tcp",
            ParseError::MissingSeparator(_) => "missing_separator",
            ParseError::IgnoredAddress(_) => "ignored_address",
            ParseError::InvalidAddress(_) => "invalid_address",
            ParseError::InvalidPort(_) => "invalid_port",
            ParseError::NoCookie => "no_cookie",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::IncompleteLine { fields } => {
                write!(f, "incomplete line ({fields} fields)")
            }
            ParseError::NotEstablishedTcp => write!(f, "not an established TCP connection"),
            ParseError::MissingSeparator(token) => {
                write!(f, "cannot split address and port in {token:?}")
            }
            ParseError::IgnoredAddress(addr) => write!(f, "ignored address {addr}"),
            ParseError::InvalidAddress(addr) => write!(f, "invalid IP address {addr:?}"),
            ParseError::InvalidPort(port) => write!(f, "invalid port {port:?}"),
            ParseError::NoCookie => write!(f, "no socket cookie"),
        }
    }
}

impl std::error::Error for ParseError {}
