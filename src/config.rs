use std::fmt;
use std::path::PathBuf;

use crate::probe::model::Protocol;
use crate::state::ratelimit::RateLimitingMethod;

/// Runtime configuration of a probing run.
///
/// Built by the CLI from its arguments; the library consumes it as-is.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface probes leave from and replies are captured on.
    pub interface: String,
    /// Protocol for input rows that do not carry their own.
    pub protocol: Protocol,
    /// Target probing rate in packets per second; 0 disables pacing.
    pub probing_rate: u64,
    pub rate_limiting_method: RateLimitingMethod,
    /// Wire copies emitted per surviving probe.
    pub n_packets: u64,
    /// Post-run drain, in seconds, for replies still in flight.
    pub sniffer_wait_time: u64,
    /// Stop after this many packets have been sent.
    pub max_probes: Option<u64>,
    pub filter_min_ttl: Option<u8>,
    pub filter_max_ttl: Option<u8>,
    /// Deny list: prefixes that must not be probed.
    pub prefix_excl_file: Option<PathBuf>,
    /// Allow list: when set, only these prefixes are probed.
    pub prefix_incl_file: Option<PathBuf>,
    /// Probe CSV input; stdin when absent.
    pub input_file: Option<PathBuf>,
    pub output_file_csv: PathBuf,
    pub output_file_pcap: Option<PathBuf>,
    /// Round tag attached to every output CSV line.
    pub meta_round: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            protocol: Protocol::Icmp,
            probing_rate: 100,
            rate_limiting_method: RateLimitingMethod::Sleep,
            n_packets: 1,
            sniffer_wait_time: 5,
            max_probes: None,
            filter_min_ttl: None,
            filter_max_ttl: None,
            prefix_excl_file: None,
            prefix_incl_file: None,
            input_file: None,
            output_file_csv: PathBuf::from("replies.csv"),
            output_file_pcap: None,
            meta_round: "1".to_string(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interface={} protocol={} probing_rate={}pps rate_limiting_method={} \
             n_packets={} sniffer_wait_time={}s max_probes={} ttl_filter={}-{} \
             output_csv={} round={}",
            self.interface,
            self.protocol,
            self.probing_rate,
            self.rate_limiting_method,
            self.n_packets,
            self.sniffer_wait_time,
            opt(&self.max_probes),
            opt(&self.filter_min_ttl),
            opt(&self.filter_max_ttl),
            self.output_file_csv.display(),
            self.meta_round,
        )
    }
}

fn opt<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}
