/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream and listener address parsing
//!
//! Upstream addresses come in three shapes:
//! - `[scheme://]ip[:port]` or `[scheme://]host[:port]` with scheme one of
//!   `udp`, `dns`, `tcp`, `tls`
//! - a SCION address `ISD-AS,ip:port`, e.g. `19-ffaa:1:1067,127.0.0.1:8853`,
//!   optionally behind `squic://`
//!
//! Without a scheme the protocol is left to the relay options.

use crate::core::error::{DnsError, Result};
use crate::network::upstream::Protocol;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use url::{Host, Url};

/// SCION isolation domain + autonomous system identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IsdAs {
    pub isd: u16,
    pub asn: u64,
}

/// ASes below this value are written in decimal (BGP compatible range)
const MAX_BGP_ASN: u64 = u32::MAX as u64;
/// SCION AS numbers are 48 bit
const MAX_ASN: u64 = (1 << 48) - 1;

impl FromStr for IsdAs {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DnsError::config(format!("invalid SCION ISD-AS: {s}"));
        let (isd, asn) = s.split_once('-').ok_or_else(invalid)?;
        let isd = isd.parse::<u16>().map_err(|_| invalid())?;

        let asn = if asn.contains(':') {
            let groups: Vec<&str> = asn.split(':').collect();
            if groups.len() != 3 {
                return Err(invalid());
            }
            let mut value = 0u64;
            for group in groups {
                if group.is_empty() || group.len() > 4 {
                    return Err(invalid());
                }
                let part = u16::from_str_radix(group, 16).map_err(|_| invalid())?;
                value = (value << 16) | part as u64;
            }
            value
        } else {
            let value = asn.parse::<u64>().map_err(|_| invalid())?;
            if value > MAX_BGP_ASN {
                return Err(invalid());
            }
            value
        };

        if asn > MAX_ASN {
            return Err(invalid());
        }
        Ok(IsdAs { isd, asn })
    }
}

impl Display for IsdAs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.asn <= MAX_BGP_ASN {
            write!(f, "{}-{}", self.isd, self.asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd,
                (self.asn >> 32) & 0xffff,
                (self.asn >> 16) & 0xffff,
                self.asn & 0xffff
            )
        }
    }
}

/// SCION endhost address: `ISD-AS,ip:port`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    pub ia: IsdAs,
    pub host: SocketAddr,
}

impl FromStr for ScionAddr {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self> {
        let (ia, host) = s
            .split_once(',')
            .ok_or_else(|| DnsError::config(format!("invalid SCION address: {s}")))?;
        Ok(ScionAddr {
            ia: ia.parse()?,
            host: host.parse()?,
        })
    }
}

impl Display for ScionAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.ia, self.host)
    }
}

/// Where an upstream lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Socket(SocketAddr),
    /// Resolved by the system resolver at dial time
    Host { name: String, port: u16 },
    Scion(ScionAddr),
}

/// Parsed upstream address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamAddr {
    raw: String,
    scheme: Option<Protocol>,
    target: Target,
}

impl UpstreamAddr {
    /// Protocol fixed by an explicit scheme, if any
    pub fn scheme(&self) -> Option<Protocol> {
        self.scheme
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_scion(&self) -> bool {
        matches!(self.target, Target::Scion(_))
    }

    /// Host name usable for TLS SNI when none is configured explicitly
    pub fn host_name(&self) -> String {
        match &self.target {
            Target::Socket(addr) => addr.ip().to_string(),
            Target::Host { name, .. } => name.clone(),
            Target::Scion(addr) => addr.host.ip().to_string(),
        }
    }
}

impl FromStr for UpstreamAddr {
    type Err = DnsError;

    fn from_str(addr: &str) -> Result<Self> {
        let (scheme_str, rest) = match addr.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, addr),
        };

        // SCION first: its ISD-AS prefix does not survive URL parsing
        if rest.contains(',') {
            if !matches!(scheme_str.as_deref(), None | Some("squic")) {
                return Err(DnsError::config(format!(
                    "scheme not supported for SCION upstream: {addr}"
                )));
            }
            return Ok(UpstreamAddr {
                raw: addr.to_string(),
                scheme: None,
                target: Target::Scion(rest.parse()?),
            });
        }

        let scheme = match scheme_str.as_deref() {
            None => None,
            Some("udp") | Some("dns") => Some(Protocol::Udp),
            Some("tcp") => Some(Protocol::Tcp),
            Some("tls") => Some(Protocol::TcpTls),
            Some(other) => {
                return Err(DnsError::config(format!(
                    "unsupported upstream scheme {other} in {addr}"
                )));
            }
        };

        let url = Url::parse(&format!("udp://{rest}"))
            .map_err(|e| DnsError::config(format!("invalid upstream address {addr}: {e}")))?;
        let port = url
            .port()
            .unwrap_or_else(|| scheme.unwrap_or(Protocol::Udp).default_port());

        // Non-special schemes keep IPv4 literals as opaque domains
        let target = match url.host() {
            Some(Host::Ipv6(ip)) => Target::Socket(SocketAddr::new(IpAddr::V6(ip), port)),
            Some(Host::Ipv4(ip)) => Target::Socket(SocketAddr::new(IpAddr::V4(ip), port)),
            Some(Host::Domain(name)) if !name.is_empty() => match name.parse::<Ipv4Addr>() {
                Ok(ip) => Target::Socket(SocketAddr::new(IpAddr::V4(ip), port)),
                Err(_) => Target::Host {
                    name: name.to_string(),
                    port,
                },
            },
            _ => {
                return Err(DnsError::config(format!(
                    "upstream address has no host: {addr}"
                )));
            }
        };

        Ok(UpstreamAddr {
            raw: addr.to_string(),
            scheme,
            target,
        })
    }
}

impl Display for UpstreamAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse `ip:port`, `[ip6]:port` or `:port` (all interfaces)
pub fn parse_optional_ip_port(s: &str) -> Result<SocketAddr> {
    if let Some(port) = s.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| DnsError::config(format!("invalid listen port: {s}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    Ok(s.parse()?)
}

/// Parse a SCION listen address: `[ISD-AS,][ip]:port`
///
/// Returns the local ISD-AS when given and the underlay socket address.
pub fn parse_scion_listen(s: &str) -> Result<(Option<IsdAs>, SocketAddr)> {
    match s.split_once(',') {
        Some((ia, host)) => Ok((Some(ia.parse()?), parse_optional_ip_port(host)?)),
        None => Ok((None, parse_optional_ip_port(s)?)),
    }
}
