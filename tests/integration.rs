//! Integration tests for the build→quote→parse pipeline
//!
//! These tests verify the flow-ID encoding end to end: probes are built
//! into wire buffers, wrapped inside synthesized ICMP error replies, and
//! fed to the parser, without requiring network access or privileges.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;

use flowtrace::export::csv::ReplyCsvWriter;
use flowtrace::lpm::Lpm;
use flowtrace::probe::builder::{
    build_icmp, build_icmpv6, build_ipv4, build_ipv6, build_udp, PAYLOAD_TWEAK_BYTES,
};
use flowtrace::probe::checksum;
use flowtrace::probe::model::{CsvProbeReader, Probe, Protocol};
use flowtrace::probe::packet::{L2, L3, Packet, ICMP_HEADER_SIZE, IPV4_HEADER_SIZE};
use flowtrace::state::stats::ProberCounters;
use flowtrace::trace::driver::{Filters, FilterVerdict};
use flowtrace::trace::parse;

const ROUTER: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);
const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const TARGET: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

/// Build a v4 probe datagram (no L2) and return its bytes.
fn build_probe_v4(protocol: Protocol, ttl: u8, target_checksum: u16, payload: usize) -> Vec<u8> {
    let mut buffer = [0u8; 256];
    let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, protocol, payload).unwrap();
    build_ipv4(&mut packet, SOURCE, TARGET, ttl).unwrap();
    match protocol {
        Protocol::Icmp => build_icmp(&mut packet, target_checksum, u16::from(ttl)).unwrap(),
        Protocol::Udp => build_udp(&mut packet, 24000, 33434, target_checksum).unwrap(),
        Protocol::Icmp6 => unreachable!(),
    }
    packet.l3().to_vec()
}

/// Wrap a quoted datagram inside a synthesized IPv4 ICMP error from `src`.
fn wrap_icmp_error_v4(src: Ipv4Addr, icmp_type: u8, quote: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_SIZE + ICMP_HEADER_SIZE + quote.len();
    let mut frame = vec![0u8; total];

    // Outer IPv4 header
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    frame[8] = 60; // reply TTL
    frame[9] = 1; // ICMP
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&SOURCE.octets());
    let ip_cksum = checksum::ipv4_header_checksum(&frame[..IPV4_HEADER_SIZE]);
    frame[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    // ICMP error header + quote
    frame[20] = icmp_type;
    frame[28..].copy_from_slice(quote);
    let icmp_cksum = checksum::finish(checksum::add(0, &frame[IPV4_HEADER_SIZE..]));
    frame[22..24].copy_from_slice(&icmp_cksum.to_be_bytes());

    frame
}

/// Wrap a quoted v6 datagram (IPv6 header + L4) inside an ICMPv6 error.
fn wrap_icmp_error_v6(src: Ipv6Addr, dst: Ipv6Addr, icmp_type: u8, quote: &[u8]) -> Vec<u8> {
    let plen = ICMP_HEADER_SIZE + quote.len();
    let mut frame = vec![0u8; 40 + plen];

    frame[0] = 0x60;
    frame[4..6].copy_from_slice(&(plen as u16).to_be_bytes());
    frame[6] = 58; // ICMPv6
    frame[7] = 60; // hop limit
    frame[8..24].copy_from_slice(&src.octets());
    frame[24..40].copy_from_slice(&dst.octets());

    frame[40] = icmp_type;
    frame[48..].copy_from_slice(quote);
    // The parser does not verify the outer ICMPv6 checksum (the kernel
    // and the pseudo header make that the capture path's job), so the
    // field can stay zero here.
    frame
}

#[test]
fn test_icmp_flow_id_tweak_scenario() {
    // ICMP echo probe to 1.2.3.4, TTL 5, target checksum 0x1234,
    // 16 bytes of payload.
    let datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);

    // IP total length = 20 + 8 + 16, IP ID = TTL.
    assert_eq!(datagram.len(), 44);
    assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 44);
    assert_eq!(u16::from_be_bytes([datagram[4], datagram[5]]), 5);
    // IP header checksum verifies.
    assert_eq!(
        checksum::finish(checksum::add(0, &datagram[..IPV4_HEADER_SIZE])),
        0
    );

    let icmp = &datagram[IPV4_HEADER_SIZE..];
    assert_eq!(icmp[0], 8);
    assert_eq!(icmp[1], 0);
    assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x1234); // id
    assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 5); // seq
    assert_eq!(u16::from_be_bytes([icmp[2], icmp[3]]), 0x1234); // checksum field

    // Re-computing the ICMP checksum over header + payload yields the target.
    let mut zeroed = icmp.to_vec();
    zeroed[2] = 0;
    zeroed[3] = 0;
    assert_eq!(checksum::finish(checksum::add(0, &zeroed)), 0x1234);
}

#[test]
fn test_ipv6_udp_length_ttl_scenario() {
    // UDP probe to 2001:db8::1, TTL 7, ports 24000 -> 33434, 8-byte payload.
    let src: Ipv6Addr = "2001:db8::aa".parse().unwrap();
    let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let ttl = 7u8;
    let payload = PAYLOAD_TWEAK_BYTES + usize::from(ttl) - 1;
    assert_eq!(payload, 8);

    let mut buffer = [0u8; 128];
    let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv6, Protocol::Udp, payload).unwrap();
    build_ipv6(&mut packet, src, dst, ttl).unwrap();
    build_udp(&mut packet, 24000, 33434, u16::from(ttl)).unwrap();

    // ip6_plen == l4_size == 16, and the TTL is recoverable from it.
    let plen = u16::from_be_bytes([packet.l3()[4], packet.l3()[5]]);
    assert_eq!(plen, 16);
    assert_eq!(packet.l4_size(), 16);
    assert_eq!(plen - 9, u16::from(ttl));

    // UDP checksum tweaked to the target and valid over the pseudo header.
    let stored = u16::from_be_bytes([packet.l4()[6], packet.l4()[7]]);
    assert_eq!(stored, u16::from(ttl));
    let partial = checksum::pseudo_v6(src, dst, 17, packet.l4_size() as u32);
    assert_eq!(checksum::finish(checksum::add(partial, packet.l4())), 0);
}

#[test]
fn test_lpm_deny_scenario() {
    let mut lpm = Lpm::new();
    lpm.insert(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8);
    assert!(lpm.lookup("10.1.2.3".parse().unwrap()));
    assert!(!lpm.lookup("11.0.0.0".parse().unwrap()));
    assert!(lpm.lookup("::ffff:10.5.5.5".parse().unwrap()));
}

#[test]
fn test_filter_accounting_scenario() {
    // Three probes: TTL below the floor, one in range, one in the deny list.
    let mut deny = Lpm::new();
    deny.insert(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8);
    let filters = Filters::new(Some(2), None, Some(deny), None);
    let counters = ProberCounters::default();
    let n_packets = 2u64;

    let probes = [
        ("1.2.3.4", 1u8),
        ("1.2.3.4", 2),
        ("10.0.0.9", 7),
    ];
    for (addr, ttl) in probes {
        counters.read.fetch_add(1, Ordering::Relaxed);
        let probe = Probe {
            dst_addr: addr.parse().unwrap(),
            src_port: 24000,
            dst_port: 33434,
            ttl,
            protocol: Protocol::Icmp,
        };
        if filters.check_and_count(&probe, &counters) {
            // Emulate the driver emitting every wire copy successfully.
            counters.sent.fetch_add(n_packets, Ordering::Relaxed);
        }
    }

    let stats = counters.snapshot();
    assert_eq!(stats.read, 3);
    assert_eq!(stats.filtered_lo_ttl, 1);
    assert_eq!(stats.filtered_prefix_excl, 1);
    assert_eq!(stats.sent, n_packets);
    // Statistics conservation.
    assert_eq!(
        stats.read,
        stats.filtered_lo_ttl
            + stats.filtered_hi_ttl
            + stats.filtered_prefix_excl
            + stats.filtered_prefix_not_incl
            + (stats.sent + stats.failed) / n_packets
    );
}

#[test]
fn test_parser_round_trip_scenario() {
    // Build the S1 probe, quote it inside a Time Exceeded from 9.9.9.9.
    let datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);

    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.reply_src_addr, IpAddr::V4(ROUTER));
    assert_eq!(reply.reply_dst_addr, IpAddr::V4(SOURCE));
    assert_eq!(reply.probe_dst_addr, IpAddr::V4(TARGET));
    assert_eq!(reply.probe_ttl_l3, 5);
    assert_eq!(reply.probe_ttl_l4, 5);
    assert_eq!(reply.probe_src_port, 0x1234); // recovered flow ID
    assert_eq!(reply.probe_dst_port, 0);
    assert_eq!(reply.probe_size, 44);
    assert_eq!(reply.probe_protocol, 1);
    assert_eq!(reply.reply_icmp_type, 11);
    assert!(reply.is_icmp_time_exceeded());
    assert!(!reply.is_from_destination());
}

#[test]
fn test_parser_udp_round_trip() {
    let datagram = build_probe_v4(Protocol::Udp, 9, 9, 8);
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);

    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.probe_src_port, 24000);
    assert_eq!(reply.probe_dst_port, 33434);
    assert_eq!(reply.probe_ttl_l3, 9);
    assert_eq!(reply.probe_ttl_l4, 9);
    assert_eq!(reply.probe_protocol, 17);
}

#[test]
fn test_parser_destination_unreachable() {
    let datagram = build_probe_v4(Protocol::Udp, 12, 12, 8);
    let frame = wrap_icmp_error_v4(TARGET, 3, &datagram);

    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.reply_icmp_type, 3);
    assert!(!reply.is_icmp_time_exceeded());
    // The destination itself replied.
    assert!(reply.is_from_destination());
}

#[test]
fn test_parser_v6_round_trip() {
    let src: Ipv6Addr = "2001:db8::aa".parse().unwrap();
    let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let router: Ipv6Addr = "2001:db8::9".parse().unwrap();
    let ttl = 7u8;
    let payload = PAYLOAD_TWEAK_BYTES + usize::from(ttl) - 1;

    let mut buffer = [0u8; 128];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv6, Protocol::Icmp6, payload).unwrap();
    build_ipv6(&mut packet, src, dst, ttl).unwrap();
    build_icmpv6(&mut packet, 0xBEEF, u16::from(ttl)).unwrap();
    let quote = packet.l3().to_vec();

    let frame = wrap_icmp_error_v6(router, src, 3, &quote);
    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.reply_src_addr, IpAddr::V6(router));
    assert_eq!(reply.probe_dst_addr, IpAddr::V6(dst));
    // TTL reconstructed from the quoted payload length.
    assert_eq!(reply.probe_ttl_l3, 7);
    assert_eq!(reply.probe_ttl_l4, 7);
    assert_eq!(reply.probe_src_port, 0xBEEF);
    assert!(reply.is_icmp_time_exceeded());
}

#[test]
fn test_parser_echo_reply() {
    // An echo reply from the destination: id/seq carry the identity.
    let mut frame = vec![0u8; IPV4_HEADER_SIZE + ICMP_HEADER_SIZE + 4];
    frame[0] = 0x45;
    let frame_len = frame.len() as u16;
    frame[2..4].copy_from_slice(&frame_len.to_be_bytes());
    frame[8] = 57;
    frame[9] = 1;
    frame[12..16].copy_from_slice(&TARGET.octets());
    frame[16..20].copy_from_slice(&SOURCE.octets());
    let ip_cksum = checksum::ipv4_header_checksum(&frame[..IPV4_HEADER_SIZE]);
    frame[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    frame[20] = 0; // echo reply
    frame[24..26].copy_from_slice(&0x1234u16.to_be_bytes()); // id
    frame[26..28].copy_from_slice(&5u16.to_be_bytes()); // seq
    let icmp_cksum = checksum::finish(checksum::add(0, &frame[IPV4_HEADER_SIZE..]));
    frame[22..24].copy_from_slice(&icmp_cksum.to_be_bytes());

    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.probe_dst_addr, IpAddr::V4(TARGET));
    assert!(reply.is_from_destination());
    assert_eq!(reply.probe_src_port, 0x1234);
    assert_eq!(reply.probe_ttl_l4, 5);
    assert_eq!(reply.probe_ttl_l3, 0);
}

#[test]
fn test_parser_drops_inconsistent_quotes() {
    // Quoted echo request whose id no longer matches the checksum field.
    let mut datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);
    datagram[24..26].copy_from_slice(&0x9999u16.to_be_bytes());
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);
    assert!(parse(&frame, L2::None, 0.0).is_none());

    // Quoted UDP whose checksum cannot be a TTL.
    let mut datagram = build_probe_v4(Protocol::Udp, 9, 9, 8);
    datagram[26..28].copy_from_slice(&0x8000u16.to_be_bytes());
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);
    assert!(parse(&frame, L2::None, 0.0).is_none());

    // Quoted UDP whose two TTL channels disagree.
    let mut datagram = build_probe_v4(Protocol::Udp, 9, 9, 8);
    datagram[4..6].copy_from_slice(&10u16.to_be_bytes()); // IP ID says 10
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);
    assert!(parse(&frame, L2::None, 0.0).is_none());
}

#[test]
fn test_parser_ignores_unrelated_icmp() {
    // A router solicitation is ICMP but not a probe reply.
    let datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);
    let frame = wrap_icmp_error_v4(ROUTER, 10, &datagram);
    assert!(parse(&frame, L2::None, 0.0).is_none());
}

#[test]
fn test_parser_extracts_mpls_labels() {
    // Legacy extension placement: quote padded to 128 bytes, then a
    // version-2 extension header with one MPLS stack object.
    let datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);
    let mut quote = datagram.clone();
    quote.resize(128, 0);
    quote.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
    quote.extend_from_slice(&8u16.to_be_bytes());
    quote.push(1); // class: MPLS label stack
    quote.push(1); // type
    quote.extend_from_slice(&[0x05, 0xDC, 0x01, 0x3C]); // label 24000, bottom, ttl 60

    let frame = wrap_icmp_error_v4(ROUTER, 11, &quote);
    let reply = parse(&frame, L2::None, 0.0).expect("reply should decode");
    assert_eq!(reply.reply_mpls_labels.len(), 1);
    assert_eq!(reply.reply_mpls_labels[0].label, 24000);
    assert!(reply.reply_mpls_labels[0].bottom);
    assert_eq!(reply.reply_mpls_labels[0].ttl, 60);
}

#[test]
fn test_reply_csv_line_format() {
    let datagram = build_probe_v4(Protocol::Icmp, 5, 0x1234, 16);
    let frame = wrap_icmp_error_v4(ROUTER, 11, &datagram);
    let reply = parse(&frame, L2::None, 0.0).unwrap();

    let mut sink = Vec::new();
    ReplyCsvWriter::new(&mut sink, "2026-08").write(&reply).unwrap();
    let line = String::from_utf8(sink).unwrap();
    let fields: Vec<&str> = line.trim_end().split(',').collect();
    assert_eq!(fields.len(), 18);
    assert_eq!(fields[0], "9.9.9.9");
    assert_eq!(fields[8], "1.2.3.4");
    assert_eq!(fields[12], "4660"); // 0x1234 in decimal
    assert_eq!(fields[16], "2026-08");
    assert_eq!(fields[17], "1");
}

#[test]
fn test_csv_probe_reader_end_to_end() {
    let input = "\
1.2.3.4,24000,33434,5,icmp
2001:db8::1,24000,33434,7,icmp6
garbage line
8.8.8.8,24000,33434,3
";
    let probes: Vec<Probe> = CsvProbeReader::new(Cursor::new(input), Protocol::Udp).collect();
    assert_eq!(probes.len(), 3);
    assert_eq!(probes[0].protocol, Protocol::Icmp);
    assert_eq!(probes[1].l3(), L3::Ipv6);
    // Missing protocol column falls back to the configured default.
    assert_eq!(probes[2].protocol, Protocol::Udp);
}

#[test]
fn test_filters_accept_when_unconfigured() {
    let filters = Filters::new(None, None, None, None);
    let probe = Probe {
        dst_addr: "203.0.113.7".parse().unwrap(),
        src_port: 1,
        dst_port: 2,
        ttl: 64,
        protocol: Protocol::Icmp,
    };
    assert_eq!(filters.check(&probe), FilterVerdict::Accept);
}
