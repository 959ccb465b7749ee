//! Run statistics for the driver and the sniffer.
//!
//! The live counter groups are written by exactly one thread each (the
//! driver for [`ProberCounters`], the capture thread for
//! [`SnifferCounters`]) and read by the periodic logger, so relaxed
//! atomics are enough. `snapshot()` produces the plain structs that the
//! driver returns.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Live counters for the probing loop.
#[derive(Debug, Default)]
pub struct ProberCounters {
    pub read: AtomicU64,
    pub filtered_lo_ttl: AtomicU64,
    pub filtered_hi_ttl: AtomicU64,
    pub filtered_prefix_excl: AtomicU64,
    pub filtered_prefix_not_incl: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

impl ProberCounters {
    pub fn snapshot(&self) -> ProberStatistics {
        ProberStatistics {
            read: self.read.load(Ordering::Relaxed),
            filtered_lo_ttl: self.filtered_lo_ttl.load(Ordering::Relaxed),
            filtered_hi_ttl: self.filtered_hi_ttl.load(Ordering::Relaxed),
            filtered_prefix_excl: self.filtered_prefix_excl.load(Ordering::Relaxed),
            filtered_prefix_not_incl: self.filtered_prefix_not_incl.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the probing loop counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProberStatistics {
    pub read: u64,
    pub filtered_lo_ttl: u64,
    pub filtered_hi_ttl: u64,
    pub filtered_prefix_excl: u64,
    pub filtered_prefix_not_incl: u64,
    pub sent: u64,
    pub failed: u64,
}

impl fmt::Display for ProberStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probes_read={} filtered_low_ttl={} filtered_high_ttl={} \
             filtered_prefix_excl={} filtered_prefix_not_incl={} packets_sent={} packets_failed={}",
            self.read,
            self.filtered_lo_ttl,
            self.filtered_hi_ttl,
            self.filtered_prefix_excl,
            self.filtered_prefix_not_incl,
            self.sent,
            self.failed
        )
    }
}

/// Live counters for the capture thread.
#[derive(Default)]
pub struct SnifferCounters {
    received: AtomicU64,
    icmp_messages_all: Mutex<HashSet<IpAddr>>,
    icmp_messages_path: Mutex<HashSet<IpAddr>>,
}

impl SnifferCounters {
    /// Count one handled frame; returns the count before the increment.
    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a decoded reply. `on_path` marks replies whose source equals
    /// the quoted probe destination.
    pub fn record_reply(&self, src: IpAddr, on_path: bool) {
        self.icmp_messages_all.lock().insert(src);
        if on_path {
            self.icmp_messages_path.lock().insert(src);
        }
    }

    pub fn snapshot(&self) -> SnifferStatistics {
        SnifferStatistics {
            received_count: self.received.load(Ordering::Relaxed),
            icmp_messages_all: self.icmp_messages_all.lock().clone(),
            icmp_messages_path: self.icmp_messages_path.lock().clone(),
        }
    }
}

/// Snapshot of the capture-side counters.
#[derive(Debug, Default, Clone)]
pub struct SnifferStatistics {
    pub received_count: u64,
    /// Distinct sources of decoded probe replies.
    pub icmp_messages_all: HashSet<IpAddr>,
    /// Distinct sources whose reply came from the probed destination itself.
    pub icmp_messages_path: HashSet<IpAddr>,
}

impl fmt::Display for SnifferStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets_received={} icmp_distinct_sources={} icmp_distinct_path_sources={}",
            self.received_count,
            self.icmp_messages_all.len(),
            self.icmp_messages_path.len()
        )
    }
}
