//! Service specifications.
//!
//! A service spec is a whitespace-separated string of 1 to 4 tokens:
//!
//! ```text
//! proto | [dir] prefix | [dir] prefix proto | [dir] prefix proto ports
//! ```
//!
//! `dir` is `src` or `dst` and may be omitted; `prefix` is an IPv4 or
//! IPv6 address, a CIDR, or `*`; `proto` is a well-known name or an
//! 8-bit protocol number; `ports` is a comma-separated list of `port`
//! or `lo-hi` entries.

use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Service spec parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("empty service spec")]
    Empty,
    #[error("too many tokens in service spec: {0}")]
    TooManyTokens(String),
    #[error("invalid prefix: {0}")]
    BadPrefix(String),
    #[error("invalid protocol: {0}")]
    BadProto(String),
    #[error("invalid port spec: {0}")]
    BadPort(String),
    #[error("ports given without a protocol: {0}")]
    PortsWithoutProto(String),
}

/// Traffic direction relative to the matched prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Src,
    Dst,
}

impl Dir {
    pub fn as_str(self) -> &'static str {
        match self {
            Dir::Src => "src",
            Dir::Dst => "dst",
        }
    }

    fn parse(token: &str) -> Option<Dir> {
        match token {
            "src" => Some(Dir::Src),
            "dst" => Some(Dir::Dst),
            _ => None,
        }
    }
}

/// An address match: a host, a CIDR, or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    Any,
    Addr(IpAddr),
    Cidr(IpAddr, u8),
}

impl Prefix {
    fn parse(token: &str) -> Option<Prefix> {
        if token == "*" {
            return Some(Prefix::Any);
        }
        if let Some((addr, len)) = token.split_once('/') {
            let addr = IpAddr::from_str(addr).ok()?;
            let len = len.parse::<u8>().ok()?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            if len > max {
                return None;
            }
            return Some(Prefix::Cidr(addr, len));
        }
        IpAddr::from_str(token).ok().map(Prefix::Addr)
    }

    pub fn is_ipv6(&self) -> bool {
        match self {
            Prefix::Any => false,
            Prefix::Addr(a) => a.is_ipv6(),
            Prefix::Cidr(a, _) => a.is_ipv6(),
        }
    }

    /// The match argument, `None` for the wildcard.
    pub fn match_arg(&self) -> Option<String> {
        match self {
            Prefix::Any => None,
            Prefix::Addr(a) => Some(a.to_string()),
            Prefix::Cidr(a, l) => Some(format!("{a}/{l}")),
        }
    }
}

/// An IP protocol, by well-known name or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Sctp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Proto {
    fn parse(token: &str) -> Option<Proto> {
        match token {
            "tcp" => Some(Proto::Tcp),
            "udp" => Some(Proto::Udp),
            "sctp" => Some(Proto::Sctp),
            "icmp" => Some(Proto::Icmp),
            "icmpv6" => Some(Proto::Icmpv6),
            _ => token.parse::<u8>().ok().map(Proto::Other),
        }
    }

    pub fn as_str(self) -> String {
        match self {
            Proto::Tcp => "tcp".into(),
            Proto::Udp => "udp".into(),
            Proto::Sctp => "sctp".into(),
            Proto::Icmp => "icmp".into(),
            Proto::Icmpv6 => "icmpv6".into(),
            Proto::Other(n) => n.to_string(),
        }
    }

    /// Whether the protocol only exists in the IPv6 family.
    pub fn is_ipv6(self) -> bool {
        matches!(self, Proto::Icmpv6)
    }
}

/// A single port or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Port(u16),
    Range(u16, u16),
}

impl PortSpec {
    fn parse(token: &str) -> Option<PortSpec> {
        if let Some((lo, hi)) = token.split_once('-') {
            let lo = lo.parse::<u16>().ok()?;
            let hi = hi.parse::<u16>().ok()?;
            if lo > hi {
                return None;
            }
            return Some(PortSpec::Range(lo, hi));
        }
        token.parse::<u16>().ok().map(PortSpec::Port)
    }

    /// The match argument (`80` or `100-200`).
    pub fn match_arg(&self) -> String {
        match self {
            PortSpec::Port(p) => p.to_string(),
            PortSpec::Range(lo, hi) => format!("{lo}-{hi}"),
        }
    }
}

/// A parsed service specification.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub dir: Option<Dir>,
    pub prefix: Option<Prefix>,
    pub proto: Option<Proto>,
    pub ports: Vec<PortSpec>,
}

impl ServiceSpec {
    /// Parse a service spec string.
    pub fn parse(spec: &str) -> Result<ServiceSpec, SpecError> {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(SpecError::Empty);
        }
        if tokens.len() > 4 {
            return Err(SpecError::TooManyTokens(spec.to_string()));
        }

        let mut out = ServiceSpec {
            dir: None,
            prefix: None,
            proto: None,
            ports: Vec::new(),
        };
        let mut idx = 0;

        if let Some(dir) = Dir::parse(tokens[0]) {
            out.dir = Some(dir);
            idx = 1;
            // an explicit direction must be followed by a prefix
            let token = tokens
                .get(idx)
                .ok_or_else(|| SpecError::BadPrefix(spec.to_string()))?;
            out.prefix =
                Some(Prefix::parse(token).ok_or_else(|| SpecError::BadPrefix(token.to_string()))?);
            idx += 1;
        } else {
            // a bare first token is a protocol when it names or encodes
            // one, otherwise a prefix
            if let Some(proto) = Proto::parse(tokens[0]) {
                if tokens.len() > 1 {
                    return Err(SpecError::TooManyTokens(spec.to_string()));
                }
                out.proto = Some(proto);
                return Ok(out);
            }
            out.prefix = Some(
                Prefix::parse(tokens[0]).ok_or_else(|| SpecError::BadPrefix(tokens[0].to_string()))?,
            );
            idx = 1;
        }

        if let Some(token) = tokens.get(idx) {
            out.proto =
                Some(Proto::parse(token).ok_or_else(|| SpecError::BadProto(token.to_string()))?);
            idx += 1;
        }

        if let Some(token) = tokens.get(idx) {
            if out.proto.is_none() {
                return Err(SpecError::PortsWithoutProto(spec.to_string()));
            }
            for part in token.split(',') {
                out.ports
                    .push(PortSpec::parse(part).ok_or_else(|| SpecError::BadPort(part.to_string()))?);
            }
            idx += 1;
        }

        if idx != tokens.len() {
            return Err(SpecError::TooManyTokens(spec.to_string()));
        }

        Ok(out)
    }

    /// True if any component forces the IPv6 ethertype.
    pub fn is_ipv6(&self) -> bool {
        self.prefix.as_ref().map(Prefix::is_ipv6).unwrap_or(false)
            || self.proto.map(Proto::is_ipv6).unwrap_or(false)
    }
}
