//! Typed error hierarchy for swarm-dl
//!
//! Every error carries enough context for the caller to decide the
//! externally visible action (disconnect, ban, log). No operation in the
//! engine retries internally; retry is emergent from re-selection across
//! the swarm.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, reset)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Protocol-level errors (wire, tracker, metainfo)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Piece failed SHA-1 verification; every listed peer supplied at
    /// least one block of the corrupted piece
    #[error("Checksum mismatch on piece {piece}")]
    Checksum {
        piece: u32,
        contributors: Vec<String>,
    },

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset mid-transfer
    ConnectionReset,
    /// I/O timeout expired (fatal for the connection, never retried)
    Timeout,
    /// Server returned error status
    HttpStatus(u16),
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Path escapes the save directory (security)
    PathTraversal,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid torrent metainfo
    InvalidTorrent,
    /// Bencode parsing error
    BencodeParse,
    /// Peer violated the wire protocol (bad index, bad length, message
    /// out of sequence)
    PeerProtocol,
    /// Tracker returned a failure or an unparseable response
    TrackerError,
}

impl EngineError {
    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// True for errors that indicate the peer misbehaved badly enough to
    /// terminate the connection
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                kind: ProtocolErrorKind::PeerProtocol,
                ..
            }
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else {
            NetworkErrorKind::Other
        };

        Self::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::TrackerError,
            message: err.to_string(),
        }
    }
}
