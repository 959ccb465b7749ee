use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

/// One entry of an RFC 4950 MPLS label stack carried in an ICMP extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MplsLabel {
    /// 20-bit label value
    pub label: u32,
    /// 3-bit traffic class
    pub exp: u8,
    /// Bottom-of-stack bit
    pub bottom: bool,
    pub ttl: u8,
}

impl MplsLabel {
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let entry = u32::from_be_bytes(*bytes);
        Self {
            label: entry >> 12,
            exp: ((entry >> 9) & 0x7) as u8,
            bottom: (entry >> 8) & 1 == 1,
            ttl: (entry & 0xFF) as u8,
        }
    }
}

/// A decoded probe reply. All numeric fields are in host byte order.
///
/// Produced by the parser, serialized to CSV by the sniffer, not retained.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    // Reply attributes (IP)
    pub reply_src_addr: IpAddr,
    pub reply_dst_addr: IpAddr,
    /// Size of the reply in bytes. For IPv6 this excludes the IP header.
    pub reply_size: u16,
    pub reply_ttl: u8,
    /// L3 protocol number of the reply (1, 58 or 17).
    pub reply_protocol: u8,

    // Reply attributes (IP -> ICMP)
    /// ICMP type, 0 if the reply is not an ICMP message.
    pub reply_icmp_type: u8,
    pub reply_icmp_code: u8,
    pub reply_mpls_labels: Vec<MplsLabel>,

    // Probe attributes recovered from the quote (IP -> ICMP -> IP)
    /// The address targeted by the probe. Replies from the destination
    /// itself have `reply_src_addr == probe_dst_addr`.
    pub probe_dst_addr: IpAddr,
    /// Size of the probe in bytes. For IPv6 this excludes the IP header.
    pub probe_size: u16,
    pub probe_ttl_l3: u8,
    pub probe_protocol: u8,

    // Probe attributes (IP -> ICMP -> IP -> ICMP/UDP)
    /// For ICMP probes this is the flow ID recovered from the quoted
    /// checksum/id fields.
    pub probe_src_port: u16,
    /// 0 for ICMP probes.
    pub probe_dst_port: u16,
    /// TTL encoded in the quoted L4 header, 0 if not recoverable.
    pub probe_ttl_l4: u8,

    /// Estimated round-trip time in milliseconds, 0 when unavailable.
    pub rtt: f64,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            reply_src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_size: 0,
            reply_ttl: 0,
            reply_protocol: 0,
            reply_icmp_type: 0,
            reply_icmp_code: 0,
            reply_mpls_labels: Vec::new(),
            probe_dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            probe_size: 0,
            probe_ttl_l3: 0,
            probe_protocol: 0,
            probe_src_port: 0,
            probe_dst_port: 0,
            probe_ttl_l4: 0,
            rtt: 0.0,
        }
    }
}

impl Reply {
    pub fn is_icmp_time_exceeded(&self) -> bool {
        (self.reply_protocol == 1 && self.reply_icmp_type == 11)
            || (self.reply_protocol == 58 && self.reply_icmp_type == 3)
    }

    /// True when the reply comes from the probed destination itself.
    pub fn is_from_destination(&self) -> bool {
        self.reply_src_addr == self.probe_dst_addr
    }

    /// Serialize in the output CSV order. The caller appends the round tag
    /// and the trailing literal.
    pub fn to_csv(&self) -> String {
        let labels = self
            .reply_mpls_labels
            .iter()
            .map(|l| l.label.to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.1}",
            self.reply_src_addr,
            self.reply_dst_addr,
            self.reply_size,
            self.reply_ttl,
            self.reply_protocol,
            self.reply_icmp_type,
            self.reply_icmp_code,
            labels,
            self.probe_dst_addr,
            self.probe_size,
            self.probe_ttl_l3,
            self.probe_protocol,
            self.probe_src_port,
            self.probe_dst_port,
            self.probe_ttl_l4,
            self.rtt,
        )
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reply_src={} probe_dst={} icmp_type={} icmp_code={} probe_ttl={}",
            self.reply_src_addr,
            self.probe_dst_addr,
            self.reply_icmp_type,
            self.reply_icmp_code,
            self.probe_ttl_l3
        )
    }
}
