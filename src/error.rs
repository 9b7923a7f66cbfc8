use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("parser error: {0}")]
    ParserError(String),

    #[error("tracker error: {0}")]
    TrackerError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("worker error: {0}")]
    WorkerError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} timed out")]
    Timeout(SocketAddr),

    #[error("unmatched info hash")]
    InfoHashMismatch,

    #[error("piece #{index} failed hash verification")]
    HashMismatch { index: u32 },

    #[error("could not find peers that have piece #{0}")]
    PieceUnavailable(u32),
}

impl ApplicationError {
    /// The connection this error was raised on can no longer be used.
    ///
    /// Anything else observed while downloading a piece only spoils that
    /// piece attempt: the piece is requeued and the worker carries on.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ApplicationError::Io(_) | ApplicationError::Timeout(_)
        )
    }
}
