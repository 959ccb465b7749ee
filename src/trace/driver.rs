//! The probing pipeline: read probes, filter, build, send, account.
//!
//! One driver thread walks the probe iterator while the sniffer captures
//! replies in the background and a small ticker thread logs statistics
//! every few seconds. Probe order is preserved as read, and the N packet
//! copies of a probe go out back to back; pacing happens once per batch.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use scopeguard::guard;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lpm::Lpm;
use crate::probe::model::Probe;
use crate::probe::sender::Sender;
use crate::state::ratelimit::{RateLimiter, RateLimiterShared};
use crate::state::stats::{ProberCounters, ProberStatistics, SnifferCounters, SnifferStatistics};
use crate::trace::sniffer::{Sniffer, DEFAULT_LISTEN_PORT};

/// Sends between two rate limiter waits.
pub const BATCH_SIZE: u64 = 128;

/// Interval of the background statistics logger.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub type ProbingStatistics = (ProberStatistics, SnifferStatistics);

/// Why a probe was dropped before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    TtlTooLow,
    TtlTooHigh,
    PrefixExcluded,
    PrefixNotIncluded,
}

/// The pre-send probe filters: TTL bounds, deny LPM, allow LPM.
pub struct Filters {
    min_ttl: Option<u8>,
    max_ttl: Option<u8>,
    prefix_excl: Option<Lpm>,
    prefix_incl: Option<Lpm>,
}

impl Filters {
    pub fn new(
        min_ttl: Option<u8>,
        max_ttl: Option<u8>,
        prefix_excl: Option<Lpm>,
        prefix_incl: Option<Lpm>,
    ) -> Self {
        Self {
            min_ttl,
            max_ttl,
            prefix_excl,
            prefix_incl,
        }
    }

    /// Load the prefix stores from the configured files. Fatal when a file
    /// cannot be opened; malformed lines inside are skipped.
    pub fn from_config(config: &Config) -> Result<Self> {
        let prefix_excl = match &config.prefix_excl_file {
            Some(path) => {
                info!("loading excluded prefixes from {}", path.display());
                let mut lpm = Lpm::new();
                lpm.insert_file(path)?;
                Some(lpm)
            }
            None => None,
        };
        let prefix_incl = match &config.prefix_incl_file {
            Some(path) => {
                info!("loading included prefixes from {}", path.display());
                let mut lpm = Lpm::new();
                lpm.insert_file(path)?;
                Some(lpm)
            }
            None => None,
        };
        Ok(Self::new(
            config.filter_min_ttl,
            config.filter_max_ttl,
            prefix_excl,
            prefix_incl,
        ))
    }

    pub fn check(&self, probe: &Probe) -> FilterVerdict {
        if let Some(min) = self.min_ttl {
            if probe.ttl < min {
                return FilterVerdict::TtlTooLow;
            }
        }
        if let Some(max) = self.max_ttl {
            if probe.ttl > max {
                return FilterVerdict::TtlTooHigh;
            }
        }
        // Excluded prefixes are a deny list.
        if let Some(excl) = &self.prefix_excl {
            if excl.lookup(probe.dst_addr) {
                return FilterVerdict::PrefixExcluded;
            }
        }
        // When an allow list is configured, only its prefixes are probed.
        if let Some(incl) = &self.prefix_incl {
            if !incl.lookup(probe.dst_addr) {
                return FilterVerdict::PrefixNotIncluded;
            }
        }
        FilterVerdict::Accept
    }

    /// Apply the filters and account the outcome. Returns true when the
    /// probe survives.
    pub fn check_and_count(&self, probe: &Probe, counters: &ProberCounters) -> bool {
        match self.check(probe) {
            FilterVerdict::Accept => true,
            FilterVerdict::TtlTooLow => {
                trace!("probe={} filter=ttl_too_low", probe);
                counters.filtered_lo_ttl.fetch_add(1, Ordering::Relaxed);
                false
            }
            FilterVerdict::TtlTooHigh => {
                trace!("probe={} filter=ttl_too_high", probe);
                counters.filtered_hi_ttl.fetch_add(1, Ordering::Relaxed);
                false
            }
            FilterVerdict::PrefixExcluded => {
                trace!("probe={} filter=prefix_excluded", probe);
                counters.filtered_prefix_excl.fetch_add(1, Ordering::Relaxed);
                false
            }
            FilterVerdict::PrefixNotIncluded => {
                trace!("probe={} filter=prefix_not_included", probe);
                counters
                    .filtered_prefix_not_incl
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Run the full probing pipeline over `probes` and return both statistics
/// snapshots once the post-run reply drain has elapsed.
pub fn probe<I>(config: &Config, probes: I) -> Result<ProbingStatistics>
where
    I: Iterator<Item = Probe>,
{
    info!("{}", config);

    let filters = Filters::from_config(config)?;

    let csv_file = File::create(&config.output_file_csv).map_err(|e| {
        Error::system(
            format!("create {}", config.output_file_csv.display()),
            e,
        )
    })?;
    let csv: Box<dyn Write + Send> = Box::new(BufWriter::new(csv_file));

    let mut sniffer = Sniffer::new(
        &config.interface,
        csv,
        config.output_file_pcap.as_deref(),
        &config.meta_round,
        DEFAULT_LISTEN_PORT,
    )?;
    sniffer.start()?;

    let mut sender = Sender::new(&config.interface)?;
    let mut limiter = RateLimiter::new(
        config.probing_rate,
        BATCH_SIZE,
        config.rate_limiting_method,
    );

    let counters = Arc::new(ProberCounters::default());

    // Periodic statistics logging on its own thread; cancelled and joined
    // whenever the driver returns, error paths included.
    let ticker_cancel = CancellationToken::new();
    let ticker = spawn_stats_ticker(
        ticker_cancel.clone(),
        counters.clone(),
        sniffer.counters(),
        limiter.shared(),
    );
    let _ticker_guard = guard((ticker_cancel, ticker), |(cancel, handle)| {
        cancel.cancel();
        let _ = handle.join();
    });

    for p in probes {
        counters.read.fetch_add(1, Ordering::Relaxed);

        if !filters.check_and_count(&p, &counters) {
            continue;
        }

        for copy in 0..config.n_packets {
            trace!("probe={} packet={}", p, copy + 1);
            match sender.send(&p) {
                Ok(_) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("probe={} error={}", p, e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Rate limit every BATCH_SIZE packets sent.
            let total = counters.sent.load(Ordering::Relaxed)
                + counters.failed.load(Ordering::Relaxed);
            if total % BATCH_SIZE == 0 {
                limiter.wait();
            }
        }

        if let Some(max_probes) = config.max_probes {
            if counters.sent.load(Ordering::Relaxed) >= max_probes {
                trace!("max_probes reached, exiting");
                break;
            }
        }
    }

    info!(
        "waiting {}s to allow the sniffer to get the last flying responses",
        config.sniffer_wait_time
    );
    thread::sleep(Duration::from_secs(config.sniffer_wait_time));
    sniffer.stop();

    let prober_stats = counters.snapshot();
    let sniffer_stats = sniffer.statistics();
    info!("{}", limiter.statistics());
    info!("{}", prober_stats);
    info!("{}", sniffer_stats);
    Ok((prober_stats, sniffer_stats))
}

/// Run the pipeline over a probe CSV stream (e.g. stdin).
pub fn probe_from_reader<R: BufRead>(config: &Config, reader: R) -> Result<ProbingStatistics> {
    let probes = crate::probe::model::CsvProbeReader::new(reader, config.protocol);
    probe(config, probes)
}

/// Run the pipeline over a probe CSV file.
pub fn probe_from_file(config: &Config, path: &Path) -> Result<ProbingStatistics> {
    if !path.exists() {
        return Err(Error::InvalidArgument(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let file = File::open(path).map_err(|e| Error::system(format!("open {}", path.display()), e))?;
    probe_from_reader(config, BufReader::new(file))
}

fn spawn_stats_ticker(
    cancel: CancellationToken,
    prober: Arc<ProberCounters>,
    sniffer: Arc<SnifferCounters>,
    limiter: Arc<RateLimiterShared>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick = Duration::from_millis(100);
        let ticks_per_log = (STATS_LOG_INTERVAL.as_millis() / tick.as_millis()) as u32;
        loop {
            for _ in 0..ticks_per_log {
                if cancel.is_cancelled() {
                    return;
                }
                thread::sleep(tick);
            }
            info!("{}", limiter.statistics());
            info!("{}", prober.snapshot());
            info!("{}", sniffer.snapshot());
        }
    })
}
