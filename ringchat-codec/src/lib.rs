pub mod error;
pub mod frame;
pub mod record;

pub use error::Error;
pub use frame::{decode_datagram, encode, encode_datagram, parse, MAX_FRAME};
pub use record::{Body, NotificationKind, PeerInfo, Record};
