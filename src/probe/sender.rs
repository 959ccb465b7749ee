//! Raw-socket transmitter for built probe packets.
//!
//! IPv4 probes are sent through an IPPROTO_RAW socket with IP_HDRINCL, so
//! the IPv4 header built by the packet builder goes out verbatim (TTL and
//! IP ID channels included). IPv6 raw sockets do not accept a caller-built
//! IP header; the L4 segment is sent instead, with the per-probe hop limit
//! applied through IPV6_UNICAST_HOPS. The checksum the builder computed
//! over the v6 pseudo header is exactly what the kernel expects, so the
//! flow ID survives.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::warn;

use crate::error::{Error, Result};
use crate::probe::builder::{
    build_icmp, build_icmpv6, build_ipv4, build_ipv6, build_udp, PAYLOAD_TWEAK_BYTES,
};
use crate::probe::interface::{bind_socket_to_interface, find_interface, source_addresses};
use crate::probe::model::{Probe, Protocol};
use crate::probe::packet::{L2, L3, Packet};

/// IPPROTO_RAW: kernel expects a complete IPv4 header from us.
const IPPROTO_RAW: i32 = 255;

/// Probe wire buffer capacity; a full-size datagram always fits.
const BUFFER_SIZE: usize = 65_535;

/// Owns the raw sockets and a reusable wire buffer.
///
/// Single-threaded by design: the driver owns the one instance, so the
/// rate limiter's accounting of sends stays trivially correct.
pub struct Sender {
    socket_v4: Socket,
    socket_icmp6: Socket,
    socket_udp6: Socket,
    src_v4: Ipv4Addr,
    src_v6: Ipv6Addr,
    buffer: Vec<u8>,
}

impl Sender {
    /// Open and bind the raw sockets. Fatal on any socket failure
    /// (typically missing CAP_NET_RAW) or unknown interface.
    pub fn new(interface: &str) -> Result<Self> {
        let iface = find_interface(interface)?;
        let (src_v4, src_v6) = source_addresses(&iface);
        if src_v4.is_unspecified() {
            warn!("interface {} has no usable IPv4 address", interface);
        }
        if src_v6.is_unspecified() {
            warn!("interface {} has no usable IPv6 address", interface);
        }

        let socket_v4 = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(SockProtocol::from(IPPROTO_RAW)),
        )
        .map_err(|e| Error::system("open raw IPv4 socket", e))?;
        socket_v4
            .set_header_included(true)
            .map_err(|e| Error::system("set IP_HDRINCL", e))?;

        let socket_icmp6 = Socket::new(Domain::IPV6, Type::RAW, Some(SockProtocol::ICMPV6))
            .map_err(|e| Error::system("open raw ICMPv6 socket", e))?;
        let socket_udp6 = Socket::new(Domain::IPV6, Type::RAW, Some(SockProtocol::UDP))
            .map_err(|e| Error::system("open raw UDPv6 socket", e))?;

        for socket in [&socket_v4, &socket_icmp6, &socket_udp6] {
            bind_socket_to_interface(socket, &iface)?;
        }

        Ok(Self {
            socket_v4,
            socket_icmp6,
            socket_udp6,
            src_v4,
            src_v6,
            buffer: vec![0u8; BUFFER_SIZE],
        })
    }

    /// Materialize the wire buffer for `probe` and transmit it.
    ///
    /// Returns the number of bytes handed to the kernel. Failures are
    /// per-send; the socket stays usable and nothing is retried here.
    pub fn send(&mut self, probe: &Probe) -> Result<usize> {
        match probe.dst_addr {
            IpAddr::V4(dst) => self.send_v4(dst, probe),
            IpAddr::V6(dst) => self.send_v6(dst, probe),
        }
    }

    fn send_v4(&mut self, dst: Ipv4Addr, probe: &Probe) -> Result<usize> {
        let mut packet = Packet::new(
            &mut self.buffer,
            L2::None,
            L3::Ipv4,
            probe.protocol,
            PAYLOAD_TWEAK_BYTES,
        )?;
        build_ipv4(&mut packet, self.src_v4, dst, probe.ttl)?;
        match probe.protocol {
            // The probe's source port is the flow ID forced into the
            // checksum; the sequence carries the TTL.
            Protocol::Icmp => build_icmp(&mut packet, probe.src_port, u16::from(probe.ttl))?,
            Protocol::Udp => build_udp(
                &mut packet,
                probe.src_port,
                probe.dst_port,
                u16::from(probe.ttl),
            )?,
            Protocol::Icmp6 => {
                return Err(Error::InvalidArgument(
                    "icmp6 probe with an IPv4 destination".into(),
                ))
            }
        }

        let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(dst), 0));
        self.socket_v4
            .send_to(packet.l3(), &addr)
            .map_err(|e| Error::system("send IPv4 probe", e))
    }

    fn send_v6(&mut self, dst: Ipv6Addr, probe: &Probe) -> Result<usize> {
        // The payload length encodes the TTL for the reply parser.
        let payload_size = PAYLOAD_TWEAK_BYTES + usize::from(probe.ttl) - 1;
        let mut packet = Packet::new(
            &mut self.buffer,
            L2::None,
            L3::Ipv6,
            probe.protocol,
            payload_size,
        )?;
        build_ipv6(&mut packet, self.src_v6, dst, probe.ttl)?;
        let socket = match probe.protocol {
            Protocol::Icmp6 => {
                build_icmpv6(&mut packet, probe.src_port, u16::from(probe.ttl))?;
                &self.socket_icmp6
            }
            Protocol::Udp => {
                build_udp(
                    &mut packet,
                    probe.src_port,
                    probe.dst_port,
                    u16::from(probe.ttl),
                )?;
                &self.socket_udp6
            }
            Protocol::Icmp => {
                return Err(Error::InvalidArgument(
                    "icmp probe with an IPv6 destination".into(),
                ))
            }
        };

        socket
            .set_unicast_hops_v6(u32::from(probe.ttl))
            .map_err(|e| Error::system("set IPv6 hop limit", e))?;
        let addr = SockAddr::from(SocketAddr::new(IpAddr::V6(dst), 0));
        socket
            .send_to(packet.l4(), &addr)
            .map_err(|e| Error::system("send IPv6 probe", e))
    }
}
