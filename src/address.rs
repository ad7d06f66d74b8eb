//! Addresses of application entities in a DICOM network.
//!
//! The textual syntax is `«ae_title»@«host»:«port»`,
//! where the AE title part is optional for [`AeAddr`]
//! and mandatory for [`FullAeAddr`].
//! The host may be an IPv4/IPv6 address or a domain name.

use std::str::FromStr;

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

/// An error parsing an AE address.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseAeAddressError {
    /// missing AE title part before `@`
    MissingAeTitle { backtrace: Backtrace },

    /// missing `:` between host and port
    MissingPort { backtrace: Backtrace },

    #[snafu(display("could not parse port number: {}", source))]
    ParsePort {
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
}

/// A network address to a DICOM node,
/// with an optional application entity title.
///
/// # Example
///
/// ```
/// # use dicom_scu::address::AeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "STORAGE@pacs.example.org:104".parse()?;
/// assert_eq!(addr.ae_title(), Some("STORAGE"));
/// assert_eq!(addr.host(), "pacs.example.org");
/// assert_eq!(addr.port(), 104);
///
/// // the AE title part may be omitted
/// let addr: AeAddr = "192.168.1.99:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeAddr {
    ae_title: Option<String>,
    host: String,
    port: u16,
}

impl AeAddr {
    pub fn new(ae_title: impl Into<Option<String>>, host: impl Into<String>, port: u16) -> Self {
        AeAddr {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` part of this address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, rest) = match s.split_once('@') {
            Some((ae_title, rest)) => (Some(ae_title.to_string()), rest),
            None => (None, s),
        };
        let (host, port) = rest.rsplit_once(':').context(MissingPortSnafu)?;
        Ok(AeAddr {
            ae_title,
            host: host.to_string(),
            port: port.parse().context(ParsePortSnafu)?,
        })
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A network address to a DICOM node
/// with a mandatory application entity title.
///
/// # Example
///
/// ```
/// # use dicom_scu::address::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "SCP-STORAGE@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "SCP-STORAGE");
/// assert_eq!(&addr.to_string(), "SCP-STORAGE@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullAeAddr {
    ae_title: String,
    host: String,
    port: u16,
}

impl FullAeAddr {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, rest) = s.split_once('@').context(MissingAeTitleSnafu)?;
        ensure!(!ae_title.is_empty(), MissingAeTitleSnafu);
        let (host, port) = rest.rsplit_once(':').context(MissingPortSnafu)?;
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            host: host.to_string(),
            port: port.parse().context(ParsePortSnafu)?,
        })
    }
}

impl From<FullAeAddr> for AeAddr {
    fn from(addr: FullAeAddr) -> Self {
        AeAddr {
            ae_title: Some(addr.ae_title),
            host: addr.host,
            port: addr.port,
        }
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_ae_addr() {
        let addr: FullAeAddr = "STORE-SCP@10.0.0.1:104".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.host(), "10.0.0.1");
        assert_eq!(addr.port(), 104);
        assert_eq!(addr.socket_addr(), "10.0.0.1:104");
    }

    #[test]
    fn parse_ae_addr_without_title() {
        let addr: AeAddr = "localhost:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 11112);
    }

    #[test]
    fn parse_ipv6_host() {
        let addr: AeAddr = "SCP@::1:104".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("SCP"));
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.port(), 104);
    }

    #[test]
    fn reject_malformed_addresses() {
        assert!("".parse::<FullAeAddr>().is_err());
        assert!("@host:104".parse::<FullAeAddr>().is_err());
        assert!("AE@host".parse::<FullAeAddr>().is_err());
        assert!("AE@host:notaport".parse::<FullAeAddr>().is_err());
        assert!("host".parse::<AeAddr>().is_err());
    }

    #[test]
    fn display_roundtrip() {
        let addr: FullAeAddr = "A-TITLE@example.org:11104".parse().unwrap();
        assert_eq!(addr.to_string(), "A-TITLE@example.org:11104");
        let reparsed: FullAeAddr = addr.to_string().parse().unwrap();
        assert_eq!(reparsed, addr);
    }
}
