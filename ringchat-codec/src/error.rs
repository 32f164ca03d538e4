use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough buffered bytes to frame a complete line yet.
    #[error("incomplete frame")]
    Incomplete,

    #[error("frame of {0} bytes exceeds the maximum record size")]
    FrameTooLarge(usize),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}
