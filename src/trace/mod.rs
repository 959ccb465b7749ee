pub mod driver;
pub mod parser;
pub mod reply;
pub mod sniffer;

pub use driver::*;
pub use parser::parse;
pub use reply::*;
pub use sniffer::*;
