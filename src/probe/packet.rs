use crate::error::{Error, Result};
use crate::probe::model::Protocol;

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;
/// BSD loopback (DLT_NULL) header size: a 4-byte link family word
pub const LOOPBACK_HEADER_SIZE: usize = 4;
/// IPv4 header size (no options)
pub const IPV4_HEADER_SIZE: usize = 20;
/// IPv6 header size
pub const IPV6_HEADER_SIZE: usize = 40;
/// ICMP/ICMPv6 echo header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;

/// L2 framing of a packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2 {
    /// No link layer; the buffer starts at the IP header (raw L3 sockets).
    None,
    /// BSD loopback framing: 4-byte family word, 2 for v4 and 30 for v6.
    BsdLoopback,
    Ethernet,
}

/// L3 protocol of a packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3 {
    Ipv4,
    Ipv6,
}

/// Typed cursor over a contiguous wire buffer.
///
/// Layer offsets are computed once from the protocol tags and are
/// monotonically increasing; construction fails if the layout does not fit
/// the buffer. The layer slices returned here are what the builder
/// functions write into, lowermost layer first.
///
/// As in the classic layering, `l3()` spans the IP header and everything
/// above it (so `l3_size` is the IPv4 total length), and `l4()` spans the
/// transport header plus payload (so `l4_size` is the UDP length and the
/// pseudo-header length).
pub struct Packet<'a> {
    buffer: &'a mut [u8],
    l2: L2,
    l3: L3,
    l4: Protocol,
    l3_offset: usize,
    l4_offset: usize,
    payload_offset: usize,
    end: usize,
}

impl<'a> Packet<'a> {
    /// Lay out a packet over `buffer` and zero the spanned region.
    pub fn new(
        buffer: &'a mut [u8],
        l2: L2,
        l3: L3,
        l4: Protocol,
        payload_size: usize,
    ) -> Result<Self> {
        let l3_offset = match l2 {
            L2::None => 0,
            L2::BsdLoopback => LOOPBACK_HEADER_SIZE,
            L2::Ethernet => ETHERNET_HEADER_SIZE,
        };
        let l4_offset = l3_offset
            + match l3 {
                L3::Ipv4 => IPV4_HEADER_SIZE,
                L3::Ipv6 => IPV6_HEADER_SIZE,
            };
        let payload_offset = l4_offset
            + match l4 {
                Protocol::Icmp | Protocol::Icmp6 => ICMP_HEADER_SIZE,
                Protocol::Udp => UDP_HEADER_SIZE,
            };
        let end = payload_offset + payload_size;
        if end > buffer.len() {
            return Err(Error::Capacity(format!(
                "packet layout needs {} bytes, buffer has {}",
                end,
                buffer.len()
            )));
        }
        buffer[..end].fill(0);
        Ok(Self {
            buffer,
            l2,
            l3,
            l4,
            l3_offset,
            l4_offset,
            payload_offset,
            end,
        })
    }

    pub fn l2_tag(&self) -> L2 {
        self.l2
    }

    pub fn l3_tag(&self) -> L3 {
        self.l3
    }

    pub fn l4_tag(&self) -> Protocol {
        self.l4
    }

    pub fn l2(&self) -> &[u8] {
        &self.buffer[..self.l3_offset]
    }

    pub fn l2_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.l3_offset]
    }

    pub fn l3(&self) -> &[u8] {
        &self.buffer[self.l3_offset..self.end]
    }

    pub fn l3_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.l3_offset..self.end]
    }

    pub fn l4(&self) -> &[u8] {
        &self.buffer[self.l4_offset..self.end]
    }

    pub fn l4_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.l4_offset..self.end]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..self.end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.payload_offset..self.end]
    }

    /// The whole frame, L2 included.
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.end]
    }

    pub fn l3_size(&self) -> usize {
        self.end - self.l3_offset
    }

    pub fn l4_size(&self) -> usize {
        self.end - self.l4_offset
    }

    pub fn payload_size(&self) -> usize {
        self.end - self.payload_offset
    }
}
