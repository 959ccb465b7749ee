//! Longest-prefix-match store for the deny/allow destination filters.
//!
//! Binary radix trie over the 128-bit address space. IPv4 prefixes are
//! stored as their v4-mapped v6 equivalent (prefix length + 96), so a
//! single trie answers both families. Built once before probing starts
//! and read-only afterwards.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    terminal: bool,
}

/// Presence-only prefix store with longest-prefix-match lookup.
#[derive(Default)]
pub struct Lpm {
    root: Node,
}

impl Lpm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `addr/prefix_len`. IPv4 prefixes are mapped into the v6 space.
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8) {
        let (bits, len) = key(addr, prefix_len);
        let mut node = &mut self.root;
        for i in 0..len {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        node.terminal = true;
    }

    pub fn insert_network(&mut self, network: IpNetwork) {
        self.insert(network.network(), network.prefix());
    }

    /// Load one CIDR per line from `path`. Blank lines and `#` comments are
    /// skipped; malformed lines are logged and skipped without failing.
    pub fn insert_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .map_err(|e| Error::system(format!("open prefix file {}", path.display()), e))?;
        for line in BufReader::new(file).lines() {
            let line = line
                .map_err(|e| Error::system(format!("read prefix file {}", path.display()), e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match IpNetwork::from_str(line) {
                Ok(network) => self.insert_network(network),
                Err(e) => warn!("line={} error={}", line, e),
            }
        }
        Ok(())
    }

    /// True iff any stored prefix covers `addr`.
    pub fn lookup(&self, addr: IpAddr) -> bool {
        let (bits, _) = key(addr, 128);
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for i in 0..128 {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    if child.terminal {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }
}

/// Address bits and effective prefix length in the unified 128-bit space.
fn key(addr: IpAddr, prefix_len: u8) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => (
            u128::from(v4.to_ipv6_mapped()),
            prefix_len.saturating_add(96).min(128),
        ),
        IpAddr::V6(v6) => (u128::from(v6), prefix_len.min(128)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_lookup_covered_and_uncovered() {
        let mut lpm = Lpm::new();
        lpm.insert(v4(10, 0, 0, 0), 8);
        assert!(lpm.lookup(v4(10, 1, 2, 3)));
        assert!(lpm.lookup(v4(10, 255, 255, 255)));
        assert!(!lpm.lookup(v4(11, 0, 0, 0)));
        assert!(!lpm.lookup(v4(9, 255, 255, 255)));
    }

    #[test]
    fn test_lookup_v4_mapped_v6() {
        let mut lpm = Lpm::new();
        lpm.insert(v4(10, 0, 0, 0), 8);
        let mapped: Ipv6Addr = "::ffff:10.5.5.5".parse().unwrap();
        assert!(lpm.lookup(IpAddr::V6(mapped)));
    }

    #[test]
    fn test_lookup_v6_prefix() {
        let mut lpm = Lpm::new();
        let net: Ipv6Addr = "2001:db8::".parse().unwrap();
        lpm.insert(IpAddr::V6(net), 32);
        assert!(lpm.lookup(IpAddr::V6("2001:db8::1".parse().unwrap())));
        assert!(lpm.lookup(IpAddr::V6("2001:db8:ffff::1".parse().unwrap())));
        assert!(!lpm.lookup(IpAddr::V6("2001:db9::1".parse().unwrap())));
    }

    #[test]
    fn test_shorter_prefix_still_matches() {
        // A host route and a covering /8: both must match their targets.
        let mut lpm = Lpm::new();
        lpm.insert(v4(192, 168, 1, 1), 32);
        lpm.insert(v4(192, 0, 0, 0), 8);
        assert!(lpm.lookup(v4(192, 168, 1, 1)));
        assert!(lpm.lookup(v4(192, 200, 0, 1)));
        assert!(!lpm.lookup(v4(193, 0, 0, 1)));
    }

    #[test]
    fn test_empty_store_matches_nothing() {
        let lpm = Lpm::new();
        assert!(!lpm.lookup(v4(10, 0, 0, 1)));
        assert!(!lpm.lookup(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_insert_file_skips_comments_and_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# deny list").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        writeln!(file, "not a cidr").unwrap();
        writeln!(file, "2001:db8::/32").unwrap();
        file.flush().unwrap();

        let mut lpm = Lpm::new();
        lpm.insert_file(file.path()).unwrap();
        assert!(lpm.lookup(v4(10, 1, 2, 3)));
        assert!(lpm.lookup(IpAddr::V6("2001:db8::1".parse().unwrap())));
        assert!(!lpm.lookup(v4(11, 0, 0, 0)));
    }

    #[test]
    fn test_insert_file_missing_is_an_error() {
        let mut lpm = Lpm::new();
        assert!(lpm
            .insert_file(Path::new("/nonexistent/prefixes.txt"))
            .is_err());
    }
}
