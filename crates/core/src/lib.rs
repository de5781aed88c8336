//! Core types, packet decoding, and watch fan-out for attrstream.

pub mod attribute;
pub mod error;
pub mod fanout;
pub mod limits;
pub mod packet;
pub mod session;
pub mod upload;

pub use attribute::Attribute;
pub use error::{Error, Result};
pub use fanout::{FanoutConfig, WatchFanout};
pub use packet::{DecodedPacket, PacketDecoder, PacketTag};
pub use session::*;
pub use upload::*;
