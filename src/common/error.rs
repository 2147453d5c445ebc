//! # Upload Failure Taxonomy
//!
//! Every way a single upload can fail. All variants are local to one
//! connection: the handler logs them, sends the matching response constant
//! and closes the socket. None of them ever reaches the accept loop.

use log::Level;
use thiserror::Error;

use super::frame;

/// Why an upload was not persisted.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed frame: undecodable id, zero or oversized declared length.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed before a field was complete. `field` names the part
    /// of the frame that was cut off; the counts are for that field.
    #[error("incomplete upload: {field} expected {expected} bytes, received {received}")]
    IncompleteUpload {
        field: &'static str,
        expected: usize,
        received: usize,
    },

    /// The peer went idle, or the whole upload took too long.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The homework id failed the format/safety check.
    #[error("invalid homework id {candidate:?}: {reason}")]
    ValidationRejected { candidate: String, reason: String },

    /// The payload is not an image in the accepted format.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Writing to disk failed (disk full, permissions, I/O).
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl UploadError {
    /// Fixed response sent to the client before the connection closes.
    pub fn response(&self) -> &'static [u8] {
        match self {
            UploadError::Protocol(_) => frame::RESPONSE_MALFORMED,
            UploadError::IncompleteUpload { .. } => frame::RESPONSE_INCOMPLETE,
            UploadError::Timeout(_) => frame::RESPONSE_TIMEOUT,
            UploadError::ValidationRejected { .. } => frame::RESPONSE_INVALID_ID,
            UploadError::InvalidImage(_) => frame::RESPONSE_INVALID_IMAGE,
            UploadError::Storage(_) => frame::RESPONSE_STORAGE_FAILURE,
        }
    }

    /// Severity this failure is logged at.
    ///
    /// Client bugs are routine in a teaching lab and stay at INFO. A bad id
    /// usually means a misconfigured client and is a WARN. Storage trouble is
    /// the operator's problem and is an ERROR.
    pub fn log_level(&self) -> Level {
        match self {
            UploadError::ValidationRejected { .. } => Level::Warn,
            UploadError::Storage(_) => Level::Error,
            _ => Level::Info,
        }
    }
}
