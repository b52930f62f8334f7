use std::io;

use thiserror::Error;

/// Errors that can abort a [`serve`](crate::serve) call.
///
/// Per-connection failures (peer resets, short writes) never surface here;
/// they are delivered to the `closed` callback of the connection they
/// belong to and terminate only that connection.
#[derive(Debug, Error)]
pub enum Error {
    /// A listen specification could not be parsed or resolved, or no
    /// specification was supplied at all.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Socket setup or polling failed before or during the loop run.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
