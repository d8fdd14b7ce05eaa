//! Error types for the engine and its subsystems.
//!
//! Each subsystem gets its own error enum, composed into the top-level
//! [`Error`] via `#[from]`. See SPEC_FULL §7 for the response each kind
//! triggers.

use thiserror::Error as ThisError;

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error type, aggregating every subsystem's errors.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::Error),
    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::Error),
    #[error("peer protocol error: {0}")]
    Peer(#[from] PeerError),
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while driving a single peer session (§4.5, §7).
#[derive(Debug, ThisError)]
pub enum PeerError {
    #[error("peer sent an info hash that doesn't match ours")]
    InvalidInfoHash,

    #[error("peer sent a malformed or truncated handshake")]
    InvalidHandshake,

    #[error("malformed wire message")]
    MalformedMessage,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the download coordinator's disk commit path (§4.4,
/// §7). A disk write failure here is fatal to the whole client.
#[derive(Debug, ThisError)]
pub enum DiskError {
    #[error("piece index {0} is out of bounds")]
    InvalidPieceIndex(crate::PieceIndex),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
