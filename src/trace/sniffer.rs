//! Background capture of probe replies.
//!
//! A dedicated OS thread reads frames from a `pnet` datalink channel
//! opened on the probing interface, filters them the way the equivalent
//! BPF program would (ICMP, ICMPv6, or UDP touching the listen port),
//! parses them into replies, and appends CSV lines and optionally raw
//! frames to the output sinks. The capture read uses a one second timeout
//! so cancellation is observed within a tick even on a quiet wire.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use pnet::datalink::{self, Channel, DataLinkReceiver};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::export::csv::ReplyCsvWriter;
use crate::export::pcap::{PcapWriter, LINKTYPE_ETHERNET, LINKTYPE_NULL};
use crate::probe::interface::find_interface;
use crate::probe::packet::L2;
use crate::state::stats::{SnifferCounters, SnifferStatistics};
use crate::trace::parser;

/// Classic traceroute destination port; replies quote it back.
pub const DEFAULT_LISTEN_PORT: u16 = 33434;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Sniffer lifecycle. `statistics()` is valid in every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct Sniffer {
    status: SnifferStatus,
    cancel: CancellationToken,
    counters: Arc<SnifferCounters>,
    worker: Option<Worker>,
    handle: Option<JoinHandle<()>>,
}

impl Sniffer {
    /// Open the capture channel and the output sinks.
    ///
    /// `csv` receives one line per decoded reply, tagged with `round`;
    /// `pcap_path`, when set, receives every filtered frame.
    pub fn new(
        interface: &str,
        csv: Box<dyn Write + Send>,
        pcap_path: Option<&Path>,
        round: &str,
        listen_port: u16,
    ) -> Result<Self> {
        let iface = find_interface(interface)?;
        // Linux delivers Ethernet-framed packets even on loopback; the
        // 4-byte family framing only shows up on the BSDs.
        let link = if iface.is_loopback() && cfg!(any(target_os = "macos", target_os = "freebsd"))
        {
            L2::BsdLoopback
        } else {
            L2::Ethernet
        };

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let rx = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported datalink channel on {interface}"
                )))
            }
            Err(e) => return Err(Error::system(format!("open capture on {interface}"), e)),
        };

        let pcap = match pcap_path {
            Some(path) => {
                let file = File::create(path)
                    .map_err(|e| Error::system(format!("create {}", path.display()), e))?;
                let link_type = match link {
                    L2::Ethernet => LINKTYPE_ETHERNET,
                    _ => LINKTYPE_NULL,
                };
                let writer = PcapWriter::new(BufWriter::new(file), link_type)
                    .map_err(|e| Error::system(format!("write {}", path.display()), e))?;
                Some(writer)
            }
            None => None,
        };

        let cancel = CancellationToken::new();
        let counters = Arc::new(SnifferCounters::default());
        Ok(Self {
            status: SnifferStatus::Idle,
            cancel: cancel.clone(),
            counters: counters.clone(),
            worker: Some(Worker {
                rx,
                link,
                listen_port,
                csv: ReplyCsvWriter::new(csv, round),
                pcap,
                counters,
                cancel,
                started: Instant::now(),
            }),
            handle: None,
        })
    }

    /// Spawn the capture thread: Idle -> Running.
    pub fn start(&mut self) -> Result<()> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        let handle = std::thread::Builder::new()
            .name("sniffer".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::system("spawn sniffer thread", e))?;
        self.handle = Some(handle);
        self.status = SnifferStatus::Running;
        Ok(())
    }

    /// Signal the capture loop and join it: Running -> Stopping -> Stopped.
    pub fn stop(&mut self) {
        if self.status != SnifferStatus::Running {
            return;
        }
        self.status = SnifferStatus::Stopping;
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sniffer thread panicked");
            }
        }
        self.status = SnifferStatus::Stopped;
    }

    pub fn status(&self) -> SnifferStatus {
        self.status
    }

    /// Snapshot of the capture counters; safe in any state.
    pub fn statistics(&self) -> SnifferStatistics {
        self.counters.snapshot()
    }

    /// Shared handle for the periodic statistics logger.
    pub fn counters(&self) -> Arc<SnifferCounters> {
        Arc::clone(&self.counters)
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        // The capture handle and the output files are released on every
        // exit path, including early returns in the driver.
        self.stop();
    }
}

struct Worker {
    rx: Box<dyn DataLinkReceiver>,
    link: L2,
    listen_port: u16,
    csv: ReplyCsvWriter<Box<dyn Write + Send>>,
    pcap: Option<PcapWriter<BufWriter<File>>>,
    counters: Arc<SnifferCounters>,
    cancel: CancellationToken,
    started: Instant,
}

impl Worker {
    fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let frame = match self.rx.next() {
                Ok(frame) => frame,
                Err(e) => {
                    if !matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
                        warn!("capture read error: {}", e);
                    }
                    continue;
                }
            };
            if !frame_filter(frame, self.link, self.listen_port) {
                continue;
            }

            // Round-reference RTT estimate: receipt time against the
            // capture start. Per-probe send times are not published.
            let rtt = self.started.elapsed().as_secs_f64() * 1000.0;
            if let Some(reply) = parser::parse(frame, self.link, rtt) {
                self.counters
                    .record_reply(reply.reply_src_addr, reply.is_from_destination());
                if let Err(e) = self.csv.write(&reply) {
                    warn!("csv write error: {}", e);
                }
                if let Some(pcap) = &mut self.pcap {
                    if let Err(e) = pcap.write_packet(SystemTime::now(), frame) {
                        warn!("pcap write error: {}", e);
                    }
                }
            }

            let before = self.counters.record_received();
            if before > 0 && (before + 1) % 1_000_000 == 0 {
                info!("{}", self.counters.snapshot());
            }
        }

        if let Err(e) = self.csv.flush() {
            warn!("csv flush error: {}", e);
        }
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.flush() {
                warn!("pcap flush error: {}", e);
            }
        }
    }
}

/// Software equivalent of the capture filter: ICMP, ICMPv6, or UDP with
/// the listen port as source or destination.
fn frame_filter(frame: &[u8], link: L2, listen_port: u16) -> bool {
    let Some((l3, is_v4)) = parser::strip_l2(frame, link) else {
        return false;
    };
    if is_v4 {
        let Some(ip) = Ipv4Packet::new(l3) else {
            return false;
        };
        let ihl = usize::from(ip.get_header_length()) * 4;
        match ip.get_next_level_protocol().0 {
            1 => true,
            17 => udp_port_match(l3.get(ihl..ihl + 4), listen_port),
            _ => false,
        }
    } else {
        let Some(ip) = Ipv6Packet::new(l3) else {
            return false;
        };
        match ip.get_next_header().0 {
            58 => true,
            17 => udp_port_match(l3.get(40..44), listen_port),
            _ => false,
        }
    }
}

fn udp_port_match(ports: Option<&[u8]>, listen_port: u16) -> bool {
    match ports {
        Some(p) if p.len() == 4 => {
            u16::from_be_bytes([p[0], p[1]]) == listen_port
                || u16::from_be_bytes([p[2], p[3]]) == listen_port
        }
        _ => false,
    }
}
