//! Reply parser: decode a captured frame back into the probe that caused it.
//!
//! ICMP error messages quote the original IP header plus the first 8 bytes
//! of the original L4 header. That quote is where probe identity lives:
//! the forced L4 checksum (the flow ID), the IPv4 ID field or the IPv6
//! payload length (the TTL), and the ports. Frames whose quoted identity
//! channels disagree are treated as stray traffic and dropped.

use std::net::IpAddr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;

use crate::probe::checksum;
use crate::probe::packet::{L2, ICMP_HEADER_SIZE, IPV4_HEADER_SIZE, IPV6_HEADER_SIZE};
use crate::trace::reply::{MplsLabel, Reply};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

// ICMP extension constants (RFC 4884, RFC 4950)
const ICMP_EXT_VERSION: u8 = 2;
const MPLS_LABEL_STACK_CLASS: u8 = 1;
const MPLS_LABEL_STACK_TYPE: u8 = 1;
const MIN_ORIGINAL_DATAGRAM: usize = 128;

/// Offset of the first payload byte the probe builder sacrifices for the
/// checksum tweak; used to reconstruct the IPv6 TTL from the quoted
/// payload length: `plen = l4_header + tweak_bytes + ttl - 1`.
const V6_PLEN_TTL_BASE: u16 = 9;

fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Parse one captured frame into a [`Reply`].
///
/// `rtt` is the caller's round-trip estimate in milliseconds (receipt time
/// against the run-start reference); pass 0.0 when no reference exists.
///
/// Returns `None` for anything that is not a reply to one of our probes:
/// non-IP frames, non-ICMP traffic, unrelated ICMP messages, and quotes
/// whose encoded identity is inconsistent.
pub fn parse(frame: &[u8], link: L2, rtt: f64) -> Option<Reply> {
    let (l3, is_v4) = strip_l2(frame, link)?;
    if is_v4 {
        parse_v4(l3, rtt)
    } else {
        parse_v6(l3, rtt)
    }
}

pub(crate) fn strip_l2(frame: &[u8], link: L2) -> Option<(&[u8], bool)> {
    match link {
        L2::Ethernet => {
            let eth = EthernetPacket::new(frame)?;
            let rest = &frame[14..];
            match eth.get_ethertype() {
                EtherTypes::Ipv4 => Some((rest, true)),
                EtherTypes::Ipv6 => Some((rest, false)),
                _ => None,
            }
        }
        L2::BsdLoopback => {
            if frame.len() < 4 {
                return None;
            }
            let family = u32::from_ne_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let rest = &frame[4..];
            // AF_INET is 2 everywhere; AF_INET6 varies across BSDs.
            match family {
                2 => Some((rest, true)),
                24 | 28 | 30 => Some((rest, false)),
                _ => None,
            }
        }
        L2::None => match frame.first()? >> 4 {
            4 => Some((frame, true)),
            6 => Some((frame, false)),
            _ => None,
        },
    }
}

fn parse_v4(data: &[u8], rtt: f64) -> Option<Reply> {
    let ip = Ipv4Packet::new(data)?;
    if ip.get_next_level_protocol().0 != IPPROTO_ICMP {
        return None;
    }
    let ihl = usize::from(ip.get_header_length()) * 4;
    // Bound by the total length so Ethernet padding never reads as data.
    let total = usize::from(ip.get_total_length()).min(data.len());
    if total < ihl + ICMP_HEADER_SIZE {
        return None;
    }
    let icmp = &data[ihl..total];

    let reply = Reply {
        reply_src_addr: IpAddr::V4(ip.get_source()),
        reply_dst_addr: IpAddr::V4(ip.get_destination()),
        reply_size: ip.get_total_length(),
        reply_ttl: ip.get_ttl(),
        reply_protocol: IPPROTO_ICMP,
        reply_icmp_type: icmp[0],
        reply_icmp_code: icmp[1],
        rtt,
        ..Default::default()
    };

    match icmp[0] {
        ICMP_TIME_EXCEEDED | ICMP_DEST_UNREACHABLE => parse_quote_v4(icmp, reply),
        ICMP_ECHO_REPLY => {
            // Destinations recompute the checksum, so only the id/seq
            // fields survive; still reject corrupted messages.
            if checksum::finish(checksum::add(0, icmp)) != 0 {
                return None;
            }
            parse_echo_reply(icmp, reply)
        }
        _ => None,
    }
}

fn parse_v6(data: &[u8], rtt: f64) -> Option<Reply> {
    let ip = Ipv6Packet::new(data)?;
    // Extension headers are not walked; probe replies arrive bare.
    if ip.get_next_header().0 != IPPROTO_ICMPV6 {
        return None;
    }
    let plen = usize::from(ip.get_payload_length());
    let available = data.len().saturating_sub(IPV6_HEADER_SIZE);
    let end = IPV6_HEADER_SIZE + plen.min(available);
    if end - IPV6_HEADER_SIZE < ICMP_HEADER_SIZE {
        return None;
    }
    let icmp = &data[IPV6_HEADER_SIZE..end];

    let reply = Reply {
        reply_src_addr: IpAddr::V6(ip.get_source()),
        reply_dst_addr: IpAddr::V6(ip.get_destination()),
        reply_size: ip.get_payload_length(),
        reply_ttl: ip.get_hop_limit(),
        reply_protocol: IPPROTO_ICMPV6,
        reply_icmp_type: icmp[0],
        reply_icmp_code: icmp[1],
        rtt,
        ..Default::default()
    };

    match icmp[0] {
        ICMPV6_TIME_EXCEEDED | ICMPV6_DEST_UNREACHABLE => parse_quote_v6(icmp, reply),
        ICMPV6_ECHO_REPLY => parse_echo_reply(icmp, reply),
        _ => None,
    }
}

/// Echo replies carry the probe's id/seq directly: the reply source is the
/// probe destination.
fn parse_echo_reply(icmp: &[u8], mut reply: Reply) -> Option<Reply> {
    if icmp.len() < ICMP_HEADER_SIZE {
        return None;
    }
    reply.probe_dst_addr = reply.reply_src_addr;
    reply.probe_size = reply.reply_size;
    reply.probe_protocol = reply.reply_protocol;
    reply.probe_src_port = be16(icmp, 4);
    reply.probe_dst_port = 0;
    reply.probe_ttl_l4 = (be16(icmp, 6) & 0xFF) as u8;
    // The original TTL at L3 is not recoverable from an echo reply.
    reply.probe_ttl_l3 = 0;
    Some(reply)
}

fn parse_quote_v4(icmp: &[u8], mut reply: Reply) -> Option<Reply> {
    if icmp.len() < ICMP_HEADER_SIZE + IPV4_HEADER_SIZE + 8 {
        return None;
    }
    let quote = &icmp[ICMP_HEADER_SIZE..];
    let inner = Ipv4Packet::new(quote)?;
    if inner.get_version() != 4 {
        return None;
    }
    let inner_ihl = usize::from(inner.get_header_length()) * 4;
    let inner_l4 = quote.get(inner_ihl..inner_ihl + 8)?;

    reply.probe_dst_addr = IpAddr::V4(inner.get_destination());
    reply.probe_size = inner.get_total_length();
    reply.probe_protocol = inner.get_next_level_protocol().0;
    // The builder mirrors the TTL into the IP ID field.
    let ip_id = inner.get_identification();
    reply.probe_ttl_l3 = if (1..=255).contains(&ip_id) {
        ip_id as u8
    } else {
        0
    };
    // RFC 4884 length field sits at byte 5 for ICMPv4, in 32-bit words.
    reply.reply_mpls_labels = parse_mpls_extensions(quote, icmp[5], 4);
    recover_quoted_l4(inner_l4, reply)
}

fn parse_quote_v6(icmp: &[u8], mut reply: Reply) -> Option<Reply> {
    if icmp.len() < ICMP_HEADER_SIZE + IPV6_HEADER_SIZE + 8 {
        return None;
    }
    let quote = &icmp[ICMP_HEADER_SIZE..];
    let inner = Ipv6Packet::new(quote)?;
    if inner.get_version() != 6 {
        return None;
    }
    let inner_l4 = quote.get(IPV6_HEADER_SIZE..IPV6_HEADER_SIZE + 8)?;

    reply.probe_dst_addr = IpAddr::V6(inner.get_destination());
    let inner_plen = inner.get_payload_length();
    reply.probe_size = inner_plen;
    reply.probe_protocol = inner.get_next_header().0;
    // The builder encodes the TTL in the payload length.
    reply.probe_ttl_l3 = match inner_plen.checked_sub(V6_PLEN_TTL_BASE) {
        Some(ttl @ 1..=255) => ttl as u8,
        _ => 0,
    };
    // RFC 4884 length field sits at byte 4 for ICMPv6, in 64-bit words.
    reply.reply_mpls_labels = parse_mpls_extensions(quote, icmp[4], 8);
    recover_quoted_l4(inner_l4, reply)
}

/// Recover identity from the first 8 quoted bytes of the probe's L4 header
/// and validate the encoded flow-ID channels against each other.
fn recover_quoted_l4(l4: &[u8], mut reply: Reply) -> Option<Reply> {
    match reply.probe_protocol {
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            let expected_type = if reply.probe_protocol == IPPROTO_ICMP {
                ICMP_ECHO_REQUEST
            } else {
                ICMPV6_ECHO_REQUEST
            };
            if l4[0] != expected_type {
                return None;
            }
            let cksum = be16(l4, 2);
            let id = be16(l4, 4);
            let seq = be16(l4, 6);
            // The id field redundantly carries the forced checksum; a
            // mismatch means this is not one of our probes.
            if id != cksum {
                return None;
            }
            reply.probe_src_port = cksum;
            reply.probe_dst_port = 0;
            reply.probe_ttl_l4 = (seq & 0xFF) as u8;
        }
        IPPROTO_UDP => {
            let cksum = be16(l4, 6);
            // UDP probes carry the TTL in the forced checksum.
            if !(1..=255).contains(&cksum) {
                return None;
            }
            reply.probe_src_port = be16(l4, 0);
            reply.probe_dst_port = be16(l4, 2);
            reply.probe_ttl_l4 = cksum as u8;
        }
        _ => return None,
    }

    // Both TTL channels must agree when both survived the quote.
    if reply.probe_ttl_l3 != 0
        && reply.probe_ttl_l4 != 0
        && reply.probe_ttl_l3 != reply.probe_ttl_l4
    {
        return None;
    }
    Some(reply)
}

/// Walk the RFC 4884 extension structure and return the first MPLS label
/// stack found (RFC 4950). `word_size` is 4 for ICMPv4 and 8 for ICMPv6;
/// a zero length field falls back to the legacy 128-byte original datagram.
fn parse_mpls_extensions(quote: &[u8], length_field: u8, word_size: usize) -> Vec<MplsLabel> {
    let ext_start = if length_field > 0 {
        usize::from(length_field) * word_size
    } else {
        MIN_ORIGINAL_DATAGRAM
    };
    if quote.len() < ext_start + 4 {
        return Vec::new();
    }
    let ext = &quote[ext_start..];
    if (ext[0] >> 4) != ICMP_EXT_VERSION {
        return Vec::new();
    }

    // Extension objects start after the 4-byte extension header.
    let mut offset = 4;
    while offset + 4 <= ext.len() {
        let obj_length = usize::from(be16(ext, offset));
        let obj_class = ext[offset + 2];
        let obj_type = ext[offset + 3];
        if obj_length < 4 || offset + obj_length > ext.len() {
            break;
        }
        if obj_class == MPLS_LABEL_STACK_CLASS && obj_type == MPLS_LABEL_STACK_TYPE {
            let mut labels = Vec::new();
            for chunk in ext[offset + 4..offset + obj_length].chunks_exact(4) {
                let label = MplsLabel::from_bytes(&[chunk[0], chunk[1], chunk[2], chunk[3]]);
                labels.push(label);
                if label.bottom {
                    break;
                }
            }
            if !labels.is_empty() {
                return labels;
            }
        }
        offset += obj_length;
    }
    Vec::new()
}
