use std::fmt;
use std::io::BufRead;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::probe::packet::L3;

/// L4 protocol of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Icmp,
    Icmp6,
    Udp,
}

impl Protocol {
    /// IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Icmp6 => 58,
            Protocol::Udp => 17,
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Protocol::Icmp),
            "icmp6" => Ok(Protocol::Icmp6),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::InvalidArgument(format!(
                "unknown protocol: {other} (expected icmp, icmp6 or udp)"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Icmp6 => write!(f, "icmp6"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A logical probe request: one destination at one TTL on one flow.
///
/// Created by the input iterator and consumed immediately by the driver;
/// never retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
    pub protocol: Protocol,
}

impl Probe {
    pub fn l3(&self) -> L3 {
        match self.dst_addr {
            IpAddr::V4(_) => L3::Ipv4,
            IpAddr::V6(_) => L3::Ipv6,
        }
    }

    /// Parse a probe from a CSV line: `dst_addr,src_port,dst_port,ttl[,protocol]`.
    ///
    /// The protocol column may be omitted, in which case `default_protocol`
    /// applies. V4-mapped V6 destinations are canonicalized to V4.
    pub fn from_csv(line: &str, default_protocol: Protocol) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(Error::InvalidArgument(format!(
                "expected 4 or 5 fields, got {}",
                fields.len()
            )));
        }

        let dst_addr: IpAddr = fields[0]
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid address: {}", fields[0])))?;
        let dst_addr = canonical(dst_addr);

        let src_port: u16 = fields[1]
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid source port: {}", fields[1])))?;
        let dst_port: u16 = fields[2].parse().map_err(|_| {
            Error::InvalidArgument(format!("invalid destination port: {}", fields[2]))
        })?;

        let ttl: u8 = fields[3]
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid ttl: {}", fields[3])))?;
        if ttl == 0 {
            return Err(Error::InvalidArgument("ttl must be in 1-255".into()));
        }

        let protocol = match fields.get(4) {
            Some(s) => s.parse()?,
            None => default_protocol,
        };

        Ok(Probe {
            dst_addr,
            src_port,
            dst_port,
            ttl,
            protocol,
        })
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.dst_addr, self.src_port, self.dst_port, self.ttl, self.protocol
        )
    }
}

/// Collapse a V4-mapped V6 address back to its V4 form.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Iterator of probes read from a CSV stream, one per line.
///
/// Malformed lines are logged at warn level and skipped; they never fail
/// the run. Blank lines are ignored.
pub struct CsvProbeReader<R> {
    reader: R,
    line: String,
    default_protocol: Protocol,
}

impl<R: BufRead> CsvProbeReader<R> {
    pub fn new(reader: R, default_protocol: Protocol) -> Self {
        Self {
            reader,
            line: String::new(),
            default_protocol,
        }
    }
}

impl<R: BufRead> Iterator for CsvProbeReader<R> {
    type Item = Probe;

    fn next(&mut self) -> Option<Probe> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!("error reading probe input: {}", e);
                    return None;
                }
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            match Probe::from_csv(line, self.default_protocol) {
                Ok(probe) => return Some(probe),
                Err(e) => warn!("line={} error={}", line, e),
            }
        }
    }
}
