/// Endpoint grammar for `proxmox_api.hosts` entries.
///
/// Accepted forms: DNS name, IPv4, bracketed IPv6 with optional trailing
/// port, unbracketed IPv6 (with a port, the last colon splits address and
/// port). An optional `http://`/`https://` prefix selects the scheme;
/// unspecified port defaults to 8006.
use crate::error::{BalancerError, Result};
use std::net::Ipv6Addr;

pub const DEFAULT_PORT: u16 = 8006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BalancerError::Config("empty API endpoint".into()));
        }

        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("https://") {
            ("https", rest)
        } else if let Some(rest) = raw.strip_prefix("http://") {
            ("http", rest)
        } else {
            ("https", raw)
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(BalancerError::Config(format!("invalid API endpoint '{}'", raw)));
        }

        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            // Bracketed IPv6, optional trailing :port.
            let close = inner.find(']').ok_or_else(|| {
                BalancerError::Config(format!("unterminated IPv6 bracket in '{}'", raw))
            })?;
            let host = &inner[..close];
            let tail = &inner[close + 1..];
            let port = if tail.is_empty() {
                DEFAULT_PORT
            } else {
                let tail = tail.strip_prefix(':').ok_or_else(|| {
                    BalancerError::Config(format!("invalid endpoint suffix in '{}'", raw))
                })?;
                parse_port(tail, raw)?
            };
            (host.to_string(), port)
        } else {
            match rest.matches(':').count() {
                0 => (rest.to_string(), DEFAULT_PORT),
                1 => {
                    let (host, port) = rest.rsplit_once(':').unwrap();
                    (host.to_string(), parse_port(port, raw)?)
                }
                _ => {
                    // Unbracketed IPv6: when the tail after the last colon is
                    // a port and the remainder is still a valid address, the
                    // last colon splits; otherwise the whole string is the
                    // address.
                    let (head, tail) = rest.rsplit_once(':').unwrap();
                    match (head.parse::<Ipv6Addr>(), tail.parse::<u16>()) {
                        (Ok(_), Ok(port)) => (head.to_string(), port),
                        _ if rest.parse::<Ipv6Addr>().is_ok() => {
                            (rest.to_string(), DEFAULT_PORT)
                        }
                        _ => {
                            return Err(BalancerError::Config(format!(
                                "invalid API endpoint '{}'",
                                raw
                            )));
                        }
                    }
                }
            }
        };

        if host.is_empty() {
            return Err(BalancerError::Config(format!("invalid API endpoint '{}'", raw)));
        }

        Ok(Self { scheme: scheme.to_string(), host, port })
    }

    /// Base URL of the JSON API on this endpoint.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}/api2/json", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/api2/json", self.scheme, self.host, self.port)
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(raw: &str, endpoint: &str) -> Result<u16> {
    raw.parse::<u16>()
        .map_err(|_| BalancerError::Config(format!("invalid port in endpoint '{}'", endpoint)))
}
