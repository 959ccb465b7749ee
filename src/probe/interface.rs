//! Network interface lookup and socket binding.
//!
//! Linux uses SO_BINDTODEVICE via `socket2::bind_device()`; macOS uses
//! IP_BOUND_IF via `bind_device_by_index()`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::datalink::{self, NetworkInterface};
use socket2::Socket;

use crate::error::{Error, Result};

/// True for fe80::/10 addresses, which need scope IDs and cannot reach
/// Internet targets.
fn is_link_local_ipv6(addr: &Ipv6Addr) -> bool {
    (0xfe80..=0xfebf).contains(&addr.segments()[0])
}

/// Resolve an interface by name. Fatal when the name does not exist.
pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| Error::InvalidArgument(format!("interface not found: {name}")))
}

/// Pick the source addresses probes will claim to originate from.
///
/// Prefers globally usable addresses; on the loopback interface the
/// loopback addresses themselves are acceptable. A missing family yields
/// the unspecified address, which only breaks probing for that family.
pub fn source_addresses(iface: &NetworkInterface) -> (Ipv4Addr, Ipv6Addr) {
    let loopback = iface.is_loopback();
    let mut v4 = None;
    let mut v6 = None;
    for network in &iface.ips {
        match network.ip() {
            IpAddr::V4(addr) if v4.is_none() && (loopback || !addr.is_loopback()) => {
                v4 = Some(addr);
            }
            IpAddr::V6(addr)
                if v6.is_none()
                    && (loopback || (!addr.is_loopback() && !is_link_local_ipv6(&addr))) =>
            {
                v6 = Some(addr);
            }
            _ => {}
        }
    }
    (
        v4.unwrap_or(Ipv4Addr::UNSPECIFIED),
        v6.unwrap_or(Ipv6Addr::UNSPECIFIED),
    )
}

/// Bind a socket to the interface so probes leave through it regardless of
/// the routing table.
pub fn bind_socket_to_interface(socket: &Socket, iface: &NetworkInterface) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        socket
            .bind_device(Some(iface.name.as_bytes()))
            .map_err(|e| Error::system(format!("bind socket to {}", iface.name), e))
    }
    #[cfg(target_os = "macos")]
    {
        use std::num::NonZeroU32;
        let index = NonZeroU32::new(iface.index)
            .ok_or_else(|| Error::InvalidArgument(format!("interface {} has no index", iface.name)))?;
        socket
            .bind_device_by_index_v4(Some(index))
            .map_err(|e| Error::system(format!("bind socket to {}", iface.name), e))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (socket, iface);
        Ok(())
    }
}
