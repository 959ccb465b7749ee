//! Minimal classic libpcap file writer for the capture dump.
//!
//! Writes the standard 24-byte global header (magic 0xa1b2c3d4, version
//! 2.4, microsecond timestamps, little-endian as produced by this host)
//! followed by one record per captured frame.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub const LINKTYPE_NULL: u32 = 0;
pub const LINKTYPE_ETHERNET: u32 = 1;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const SNAPLEN: u32 = 65_535;

pub struct PcapWriter<W: Write> {
    writer: W,
}

impl<W: Write> PcapWriter<W> {
    /// Write the global header and return the writer.
    pub fn new(mut writer: W, link_type: u32) -> io::Result<Self> {
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&2u16.to_le_bytes())?; // version major
        writer.write_all(&4u16.to_le_bytes())?; // version minor
        writer.write_all(&0i32.to_le_bytes())?; // thiszone
        writer.write_all(&0u32.to_le_bytes())?; // sigfigs
        writer.write_all(&SNAPLEN.to_le_bytes())?;
        writer.write_all(&link_type.to_le_bytes())?;
        Ok(Self { writer })
    }

    /// Append one frame, truncated to the snap length.
    pub fn write_packet(&mut self, timestamp: SystemTime, data: &[u8]) -> io::Result<()> {
        let since_epoch = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let incl_len = data.len().min(SNAPLEN as usize);
        self.writer
            .write_all(&(since_epoch.as_secs() as u32).to_le_bytes())?;
        self.writer
            .write_all(&since_epoch.subsec_micros().to_le_bytes())?;
        self.writer.write_all(&(incl_len as u32).to_le_bytes())?;
        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(&data[..incl_len])
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
