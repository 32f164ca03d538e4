pub mod config;
pub mod detector;
pub mod discovery;
pub mod election;
pub mod peers;
pub mod replicate;
pub mod ring;
pub mod server;
pub mod session;

pub const DEFAULT_PORT: u16 = 8001;

pub type Error = ringchat_core::Error;

pub type Result<T> = ringchat_core::Result<T>;
