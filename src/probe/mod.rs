pub mod builder;
pub mod checksum;
pub mod interface;
pub mod model;
pub mod packet;
pub mod sender;

pub use builder::*;
pub use model::*;
pub use packet::*;
pub use sender::*;
