//! Transfer error types

use thiserror::Error;

/// Errors raised inside the transfer engine.
///
/// `Transfer::pump` never surfaces these to the caller; they are converted
/// into an Error packet on the wire plus an Abort state and a progress
/// message. The enum exists so the internal layers can propagate failures
/// with `?` and so tests can assert on precise failure classes.
#[derive(Error, Debug)]
pub enum TransferError {
    /// A frame failed length, header-check or block-check validation
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// A packet type arrived that is not valid in the current state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer used a capability that was never negotiated or is not served
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No usable input arrived before the negotiated timeout, too many times
    #[error("too many timeouts")]
    TooManyTimeouts,

    /// Filesystem failure while reading or writing transfer data
    #[error("disk i/o error: {0}")]
    Disk(#[from] std::io::Error),

    /// Three consecutive ETX bytes arrived on the channel
    #[error("aborted from the channel")]
    UserAbort,

    /// The peer sent an Error packet; the payload is its diagnostic text
    #[error("remote error: {0}")]
    Remote(String),

    /// The caller tore the transfer down mid-flight
    #[error("transfer cancelled")]
    Cancelled,
}
