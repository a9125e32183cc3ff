//! Error types callers need to tell apart.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedsetError {
    #[error("another feedset run holds the lock at {0}")]
    AlreadyRunning(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown feed: {0}")]
    UnknownFeed(String),

    #[error("base directory {0} does not exist")]
    MissingBaseDir(String),
}
