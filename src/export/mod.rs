pub mod csv;
pub mod pcap;

pub use csv::*;
pub use pcap::*;
