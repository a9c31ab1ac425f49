//! The error type shared by all parts of the engine.

use std::fmt;

pub use crate::tracker::TrackerError;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The possible errors that may occur while downloading a torrent.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failure while reading or writing download data or the resume file.
    Io(std::io::Error),
    /// The torrent metainfo file could not be decoded.
    Bencode(serde_bencode::Error),
    /// The torrent metainfo decoded but is structurally invalid.
    InvalidMetainfo(&'static str),
    /// A resume file exists for this torrent but could not be parsed.
    ResumeCorrupt(serde_json::Error),
    /// A piece index outside the torrent's piece count was used.
    InvalidPieceIndex,
    /// Peer advertised a different torrent in its handshake.
    InvalidPeerInfoHash,
    /// Peer sent a bitfield message after the availability exchange.
    BitfieldNotAfterHandshake,
    /// Peer closed the connection or sent a malformed frame.
    PeerDisconnected,
    /// Peer has no piece that we still need.
    PeerNotUseful,
    /// A piece assembled from this peer failed SHA-1 verification. The
    /// piece itself stays re-claimable by any session.
    PieceHashMismatch,
    /// A network operation did not complete in time.
    Timeout,
    /// Errors from announcing to a tracker.
    Tracker(TrackerError),
    /// A channel to another engine task was unexpectedly closed.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Bencode(e) => write!(f, "invalid metainfo: {}", e),
            Self::InvalidMetainfo(what) => {
                write!(f, "invalid metainfo: {}", what)
            }
            Self::ResumeCorrupt(e) => write!(f, "corrupt resume file: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake carried a different info hash")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield after availability exchange")
            }
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::PeerNotUseful => write!(f, "peer has no needed pieces"),
            Self::PieceHashMismatch => {
                write!(f, "piece failed SHA-1 verification")
            }
            Self::Timeout => write!(f, "operation timed out"),
            Self::Tracker(e) => write!(f, "tracker: {}", e),
            Self::ChannelClosed => write!(f, "engine channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ResumeCorrupt(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}
