use std::io;
use thiserror::Error;

/// Errors surfaced by the reactor, the trie and the socket helpers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The wait call itself failed (anything but a timeout or EINTR).
    #[error("poll failed: {0}")]
    Poll(io::Error),

    #[error("{registry} registry exhausted ({limit} entries)")]
    Exhausted { registry: &'static str, limit: usize },

    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
