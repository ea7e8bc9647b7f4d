//! Error types for sessions.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::compression::CompressionError;
use crate::wire::DecodeError;
use crate::{Frame, PlayerHandle};

/// This enum contains all errors this library can return. Most errors are
/// recoverable; a session stays usable after returning one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramelockError {
    /// The session is not synchronized yet. Keep polling and retry later.
    NotSynchronized,
    /// The function you called is invalid with the given arguments or in
    /// the session's current state.
    InvalidRequest {
        /// Further specifies why the request is invalid.
        info: String,
    },
    /// In a [`SyncTestSession`], this error is returned if checksums of
    /// resimulated frames do not match up with the original checksum.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch occurred.
        current_frame: Frame,
        /// The frames where the mismatched checksums were computed.
        mismatched_frames: Vec<Frame>,
    },
    /// A player's confirmed input for the requested frame is not available.
    MissingInput {
        /// The player the input is missing for.
        handle: PlayerHandle,
        /// The requested frame.
        frame: Frame,
    },
    /// The spectator fell too far behind the host and cannot catch up.
    SpectatorTooFarBehind,
    /// No saved state exists for the requested frame.
    StateMissing {
        /// The requested frame.
        frame: Frame,
    },
    /// A wire message or save state failed to decode.
    Decode(DecodeError),
    /// Input compression or decompression failed.
    Compression(CompressionError),
}

impl Display for FramelockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramelockError::NotSynchronized => {
                write!(f, "the session is not yet synchronized with all remote clients")
            }
            FramelockError::InvalidRequest { info } => {
                write!(f, "invalid request: {info}")
            }
            FramelockError::MismatchedChecksum { current_frame, mismatched_frames } => {
                write!(
                    f,
                    "detected checksum mismatch during rollback on frame {current_frame}, \
                     mismatched frames: {mismatched_frames:?}"
                )
            }
            FramelockError::MissingInput { handle, frame } => {
                write!(f, "no confirmed input for player {handle} at frame {frame}")
            }
            FramelockError::SpectatorTooFarBehind => {
                write!(f, "the spectator fell too far behind the host")
            }
            FramelockError::StateMissing { frame } => {
                write!(f, "no saved state for frame {frame}")
            }
            FramelockError::Decode(err) => write!(f, "decode error: {err}"),
            FramelockError::Compression(err) => write!(f, "compression error: {err}"),
        }
    }
}

impl Error for FramelockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FramelockError::Decode(err) => Some(err),
            FramelockError::Compression(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for FramelockError {
    fn from(err: DecodeError) -> Self {
        FramelockError::Decode(err)
    }
}

impl From<CompressionError> for FramelockError {
    fn from(err: CompressionError) -> Self {
        FramelockError::Compression(err)
    }
}
