use std::fmt;
use std::net::Ipv4Addr;

use crate::errors::{Error, Result};
use crate::sim::flow::{FlowMatch, L3Type, L4Type};

/// Which traffic a pipeline captures: IPv4 with the given transport,
/// optionally restricted to one source address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrafficFilter {
    pub source_ip: Option<Ipv4Addr>,
    pub transport: L4Type,
}

impl Default for TrafficFilter {
    fn default() -> Self {
        Self {
            source_ip: None,
            transport: L4Type::Tcp,
        }
    }
}

impl TrafficFilter {
    /// Parses the user-facing filter strings.
    ///
    /// An empty (or all-zero) source address means "any source". Anything
    /// else must be a dotted-quad IPv4 address.
    pub fn parse(source_ip: &str, transport: &str) -> Result<Self> {
        let source = source_ip.trim();
        let source_ip = if source.is_empty() {
            None
        } else {
            let addr: Ipv4Addr = source.parse().map_err(|e: std::net::AddrParseError| {
                Error::FilterParse {
                    input: source_ip.to_owned(),
                    reason: e.to_string(),
                }
            })?;
            (!addr.is_unspecified()).then_some(addr)
        };

        let transport = match transport.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => L4Type::Tcp,
            "udp" => L4Type::Udp,
            _ => {
                return Err(Error::FilterParse {
                    input: transport.to_owned(),
                    reason: "transport must be tcp or udp".to_owned(),
                });
            }
        };

        Ok(Self {
            source_ip,
            transport,
        })
    }

    /// Template matched by the basic pipe.
    pub(crate) fn pipe_match(&self) -> FlowMatch {
        FlowMatch {
            l3: Some(L3Type::Ipv4),
            l4: Some(self.transport),
            ..Default::default()
        }
    }

    /// Criteria of the root entry steering into the basic pipe.
    pub(crate) fn root_match(&self) -> FlowMatch {
        FlowMatch {
            src_ip: self.source_ip,
            ..self.pipe_match()
        }
    }
}

impl fmt::Display for TrafficFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.transport {
            L4Type::Tcp => "tcp",
            L4Type::Udp => "udp",
        };
        match self.source_ip {
            Some(ip) => write!(f, "ipv4/{proto} from {ip}"),
            None => write!(f, "ipv4/{proto} from any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_means_any() {
        let f = TrafficFilter::parse("", "tcp").unwrap();
        assert_eq!(f, TrafficFilter::default());
        assert_eq!(TrafficFilter::parse("0.0.0.0", "").unwrap().source_ip, None);
        assert_eq!(f.root_match().src_ip, None);
    }

    #[test]
    fn source_and_transport() {
        let f = TrafficFilter::parse(" 10.0.0.5 ", "UDP").unwrap();
        assert_eq!(f.source_ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(f.transport, L4Type::Udp);
        assert_eq!(f.root_match().l4, Some(L4Type::Udp));
        assert_eq!(f.to_string(), "ipv4/udp from 10.0.0.5");
    }

    #[test]
    fn malformed_input_is_rejected() {
        for bad in ["10.0.0", "10.0.0.256", "host.example", "10.0.0.5/24"] {
            assert!(
                matches!(TrafficFilter::parse(bad, "tcp"), Err(Error::FilterParse { .. })),
                "{bad}"
            );
        }
        assert!(matches!(
            TrafficFilter::parse("", "sctp"),
            Err(Error::FilterParse { input, .. }) if input == "sctp"
        ));
    }
}
