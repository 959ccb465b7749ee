use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use flowtrace::config::Config;

/// High-rate traceroute prober: reads probe descriptors from CSV, emits
/// crafted ICMP/UDP packets with checksum-encoded flow IDs, and captures
/// the replies they elicit.
#[derive(Parser, Debug, Clone)]
#[command(name = "flowtrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Interface to probe from and capture on (e.g., eth0)
    #[arg(short = 'i', long = "interface")]
    pub interface: String,

    /// Protocol for input rows without one (icmp, icmp6, udp)
    #[arg(short = 'p', long = "protocol", default_value = "icmp")]
    pub protocol: String,

    /// Target probing rate in packets per second (0 = unlimited)
    #[arg(short = 'r', long = "probing-rate", default_value = "100")]
    pub probing_rate: u64,

    /// Rate limiting method (sleep, busy)
    #[arg(long = "rate-limiting-method", default_value = "sleep")]
    pub rate_limiting_method: String,

    /// Number of packet copies to send per probe
    #[arg(short = 'N', long = "n-packets", default_value = "1")]
    pub n_packets: u64,

    /// Seconds to keep capturing after the last probe
    #[arg(long = "sniffer-wait-time", default_value = "5")]
    pub sniffer_wait_time: u64,

    /// Stop once this many packets have been sent
    #[arg(long = "max-probes")]
    pub max_probes: Option<u64>,

    /// Drop probes with a TTL below this value
    #[arg(long = "filter-min-ttl")]
    pub filter_min_ttl: Option<u8>,

    /// Drop probes with a TTL above this value
    #[arg(long = "filter-max-ttl")]
    pub filter_max_ttl: Option<u8>,

    /// Prefix deny list file, one CIDR per line
    #[arg(long = "prefix-excl-file")]
    pub prefix_excl_file: Option<PathBuf>,

    /// Prefix allow list file, one CIDR per line
    #[arg(long = "prefix-incl-file")]
    pub prefix_incl_file: Option<PathBuf>,

    /// Probe CSV input file (stdin if omitted)
    #[arg(long = "input-file")]
    pub input_file: Option<PathBuf>,

    /// Reply CSV output file
    #[arg(short = 'o', long = "output-file-csv", default_value = "replies.csv")]
    pub output_file_csv: PathBuf,

    /// Raw capture output file (libpcap format)
    #[arg(long = "output-file-pcap")]
    pub output_file_pcap: Option<PathBuf>,

    /// Round tag attached to every output CSV line
    #[arg(long = "meta-round", default_value = "1")]
    pub meta_round: String,

    /// Log at debug level instead of info
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.interface.is_empty() {
            return Err("Interface name cannot be empty".into());
        }
        // IFNAMSIZ on Linux is 16 including null terminator
        if self.interface.len() > 15 {
            return Err(format!(
                "Interface name too long: {} (max 15 chars)",
                self.interface
            ));
        }

        if self.n_packets == 0 {
            return Err("n-packets must be at least 1".into());
        }

        if let (Some(min), Some(max)) = (self.filter_min_ttl, self.filter_max_ttl) {
            if min > max {
                return Err(format!("filter-min-ttl {min} exceeds filter-max-ttl {max}"));
            }
        }

        Ok(())
    }

    pub fn to_config(&self) -> Result<Config> {
        let protocol = self
            .protocol
            .parse()
            .with_context(|| format!("invalid --protocol {}", self.protocol))?;
        let rate_limiting_method = self
            .rate_limiting_method
            .parse()
            .with_context(|| format!("invalid --rate-limiting-method {}", self.rate_limiting_method))?;

        Ok(Config {
            interface: self.interface.clone(),
            protocol,
            probing_rate: self.probing_rate,
            rate_limiting_method,
            n_packets: self.n_packets,
            sniffer_wait_time: self.sniffer_wait_time,
            max_probes: self.max_probes,
            filter_min_ttl: self.filter_min_ttl,
            filter_max_ttl: self.filter_max_ttl,
            prefix_excl_file: self.prefix_excl_file.clone(),
            prefix_incl_file: self.prefix_incl_file.clone(),
            input_file: self.input_file.clone(),
            output_file_csv: self.output_file_csv.clone(),
            output_file_pcap: self.output_file_pcap.clone(),
            meta_round: self.meta_round.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtrace::probe::model::Protocol;

    fn base_args() -> Args {
        Args::parse_from(["flowtrace", "-i", "eth0"])
    }

    #[test]
    fn test_defaults_build_a_config() {
        let args = base_args();
        args.validate().unwrap();
        let config = args.to_config().unwrap();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.protocol, Protocol::Icmp);
        assert_eq!(config.probing_rate, 100);
        assert_eq!(config.n_packets, 1);
    }

    #[test]
    fn test_validate_rejects_zero_packets() {
        let mut args = base_args();
        args.n_packets = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_ttl_bounds() {
        let mut args = base_args();
        args.filter_min_ttl = Some(10);
        args.filter_max_ttl = Some(5);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_bad_protocol_fails_config() {
        let mut args = base_args();
        args.protocol = "tcp".into();
        assert!(args.to_config().is_err());
    }
}
