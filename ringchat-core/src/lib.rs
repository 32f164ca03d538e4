mod connection;
pub use connection::{Connection, FrameReader, FrameWriter};
mod shutdown;
pub use shutdown::{Shutdown, ShutdownNotify};

pub mod codec {
    pub use ringchat_codec::*;
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
