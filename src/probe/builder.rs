//! Functions for building probe packets.
//!
//! These are meant to be called in order, from the lowermost layer to the
//! uppermost: L2 framing (if any), then the IP header, then the transport
//! header. The transport builders force the L4 checksum to a chosen target
//! value (the flow ID) by writing a compensator word at the start of the
//! payload, so the packet stays wire-valid while the checksum survives
//! ICMP quoting.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpTypes};
use pnet::packet::icmpv6::echo_request::MutableEchoRequestPacket as MutableEchoRequestV6Packet;
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Types};
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::udp::MutableUdpPacket;
use pnet::util::MacAddr;

use crate::error::{Error, Result};
use crate::probe::checksum;
use crate::probe::model::Protocol;
use crate::probe::packet::{L2, L3, Packet, IPV4_HEADER_SIZE, LOOPBACK_HEADER_SIZE};

/// Minimum payload needed to host the checksum compensator word.
pub const PAYLOAD_TWEAK_BYTES: usize = 2;

fn assert_payload_size(packet: &Packet<'_>, min_size: usize) -> Result<()> {
    if packet.payload_size() < min_size {
        return Err(Error::InvalidArgument(format!(
            "the payload must be at least {min_size} bytes long to allow for a custom checksum"
        )));
    }
    Ok(())
}

fn truncated(layer: &str) -> Error {
    Error::Capacity(format!("{layer} slice too small for its header"))
}

/// Checksum of the transport segment as it would be on the wire, pseudo
/// header included for IPv4 UDP and everything over IPv6. The L4 checksum
/// field must be zeroed before calling. The IP header must already be
/// built, since the pseudo header reads the addresses from it.
pub fn transport_checksum(packet: &Packet<'_>) -> Result<u16> {
    let partial = match packet.l3_tag() {
        L3::Ipv4 => {
            let ip = Ipv4Packet::new(packet.l3()).ok_or_else(|| truncated("l3"))?;
            checksum::pseudo_v4(
                ip.get_source(),
                ip.get_destination(),
                packet.l4_tag().number(),
                l4_len_u16(packet)?,
            )
        }
        L3::Ipv6 => {
            let ip = Ipv6Packet::new(packet.l3()).ok_or_else(|| truncated("l3"))?;
            checksum::pseudo_v6(
                ip.get_source(),
                ip.get_destination(),
                packet.l4_tag().number(),
                packet.l4_size() as u32,
            )
        }
    };
    Ok(checksum::finish(checksum::add(partial, packet.l4())))
}

fn l4_len_u16(packet: &Packet<'_>) -> Result<u16> {
    u16::try_from(packet.l4_size())
        .map_err(|_| Error::Capacity("l4 segment exceeds 65535 bytes".into()))
}

fn l3_len_u16(packet: &Packet<'_>) -> Result<u16> {
    u16::try_from(packet.l3_size())
        .map_err(|_| Error::Capacity("l3 datagram exceeds 65535 bytes".into()))
}

/// Write the BSD loopback family word: 2 for IPv4, 30 for IPv6,
/// host byte order as DLT_NULL prescribes.
pub fn build_loopback(packet: &mut Packet<'_>) -> Result<()> {
    if packet.l2_tag() != L2::BsdLoopback {
        return Err(Error::InvalidArgument(
            "packet has no loopback framing".into(),
        ));
    }
    let family: u32 = match packet.l3_tag() {
        L3::Ipv4 => 2,
        L3::Ipv6 => 30,
    };
    packet.l2_mut()[..LOOPBACK_HEADER_SIZE].copy_from_slice(&family.to_ne_bytes());
    Ok(())
}

/// Write the Ethernet header.
pub fn build_ethernet(packet: &mut Packet<'_>, src: MacAddr, dst: MacAddr) -> Result<()> {
    let ethertype = match packet.l3_tag() {
        L3::Ipv4 => EtherTypes::Ipv4,
        L3::Ipv6 => EtherTypes::Ipv6,
    };
    let mut eth = MutableEthernetPacket::new(packet.l2_mut())
        .ok_or_else(|| Error::InvalidArgument("packet has no ethernet framing".into()))?;
    eth.set_source(src);
    eth.set_destination(dst);
    eth.set_ethertype(ethertype);
    Ok(())
}

/// Write the IPv4 header. The IP ID field carries the TTL as a secondary
/// identity channel that survives ICMP quoting.
pub fn build_ipv4(packet: &mut Packet<'_>, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> Result<()> {
    let total_length = l3_len_u16(packet)?;
    let protocol = IpNextHeaderProtocol::new(packet.l4_tag().number());
    let mut ip = MutableIpv4Packet::new(packet.l3_mut()).ok_or_else(|| truncated("l3"))?;
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_dscp(0);
    ip.set_ecn(0);
    ip.set_total_length(total_length);
    ip.set_identification(u16::from(ttl));
    ip.set_flags(0);
    ip.set_fragment_offset(0);
    ip.set_ttl(ttl);
    ip.set_next_level_protocol(protocol);
    ip.set_source(src);
    ip.set_destination(dst);
    ip.set_checksum(0);
    let cksum = checksum::ipv4_header_checksum(&packet.l3()[..IPV4_HEADER_SIZE]);
    let mut ip = MutableIpv4Packet::new(packet.l3_mut()).ok_or_else(|| truncated("l3"))?;
    ip.set_checksum(cksum);
    Ok(())
}

/// Write the IPv6 header. The TTL cannot ride in the flow label (load
/// balancers hash it, unlike IPv4); the caller instead sizes the payload
/// so the quoted payload length encodes it.
pub fn build_ipv6(packet: &mut Packet<'_>, src: Ipv6Addr, dst: Ipv6Addr, ttl: u8) -> Result<()> {
    let payload_length = l4_len_u16(packet)?;
    let protocol = IpNextHeaderProtocol::new(packet.l4_tag().number());
    let mut ip = MutableIpv6Packet::new(packet.l3_mut()).ok_or_else(|| truncated("l3"))?;
    ip.set_version(6);
    ip.set_traffic_class(0);
    ip.set_flow_label(0);
    ip.set_payload_length(payload_length);
    ip.set_next_header(protocol);
    ip.set_hop_limit(ttl);
    ip.set_source(src);
    ip.set_destination(dst);
    Ok(())
}

/// Write an ICMP echo request whose checksum equals `target_checksum`.
///
/// The identifier carries the target checksum as a redundant channel; the
/// sequence number is caller supplied (typically the TTL). The ICMPv4
/// checksum covers only the ICMP header and payload.
pub fn build_icmp(packet: &mut Packet<'_>, target_checksum: u16, seq: u16) -> Result<()> {
    assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;

    let mut icmp =
        MutableEchoRequestPacket::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    icmp.set_icmp_type(IcmpTypes::EchoRequest);
    icmp.set_icmp_code(IcmpCode::new(0));
    icmp.set_checksum(0);
    icmp.set_identifier(target_checksum);
    icmp.set_sequence_number(seq);

    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].fill(0);
    let original = checksum::finish(checksum::add(0, packet.l4()));
    let word = checksum::tweak(original, target_checksum);
    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&word.to_be_bytes());

    let mut icmp =
        MutableEchoRequestPacket::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    icmp.set_checksum(target_checksum);
    Ok(())
}

/// Write an ICMPv6 echo request whose checksum equals `target_checksum`.
///
/// The checksum computation differs from ICMPv4: it covers the IPv6 pseudo
/// header, so the IPv6 header must be built first.
pub fn build_icmpv6(packet: &mut Packet<'_>, target_checksum: u16, seq: u16) -> Result<()> {
    assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;

    let mut icmp =
        MutableEchoRequestV6Packet::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    icmp.set_icmpv6_type(Icmpv6Types::EchoRequest);
    icmp.set_icmpv6_code(Icmpv6Code::new(0));
    icmp.set_checksum(0);
    icmp.set_identifier(target_checksum);
    icmp.set_sequence_number(seq);

    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].fill(0);
    let original = transport_checksum(packet)?;
    let word = checksum::tweak(original, target_checksum);
    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&word.to_be_bytes());

    let mut icmp =
        MutableEchoRequestV6Packet::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    icmp.set_checksum(target_checksum);
    Ok(())
}

/// Write a UDP header with the checksum tweaked to `target_checksum`.
///
/// A target of 0x0000 is rejected: on IPv4 it would read as "no checksum"
/// and on IPv6 it is outright illegal, so the flow ID space excludes it.
pub fn build_udp(
    packet: &mut Packet<'_>,
    src_port: u16,
    dst_port: u16,
    target_checksum: u16,
) -> Result<()> {
    assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;
    if target_checksum == 0 {
        return Err(Error::InvalidArgument(
            "UDP target checksum 0x0000 means 'no checksum' and cannot be used".into(),
        ));
    }

    let length = l4_len_u16(packet)?;
    let mut udp = MutableUdpPacket::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    udp.set_source(src_port);
    udp.set_destination(dst_port);
    udp.set_length(length);
    udp.set_checksum(0);

    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].fill(0);
    let original = transport_checksum(packet)?;
    let word = checksum::tweak(original, target_checksum);
    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&word.to_be_bytes());

    let mut udp = MutableUdpPacket::new(packet.l4_mut()).ok_or_else(|| truncated("l4"))?;
    udp.set_checksum(target_checksum);
    Ok(())
}
