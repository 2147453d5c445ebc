//! # Upload Framing
//!
//! Reads one upload off a byte stream. TCP gives no message boundaries, so
//! every field is accumulated across as many reads as it takes.
//!
//! ## Wire Protocol
//!
//! ```text
//! [9 bytes: homework id, ASCII] [4 bytes: image length, big-endian u32] [N bytes: image]
//! ```
//!
//! The server answers with exactly one of the `RESPONSE_*` constants below
//! and closes the connection. Student clients implement this independently,
//! so any change here breaks every deployed client.

use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use super::error::UploadError;
use super::identifier::HOMEWORK_ID_LENGTH;

/// Size of the big-endian length prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;

pub const RESPONSE_SUCCESS: &[u8] = b"SUCCESS";
pub const RESPONSE_MALFORMED: &[u8] = b"ERROR: malformed frame";
pub const RESPONSE_INCOMPLETE: &[u8] = b"ERROR: incomplete upload";
pub const RESPONSE_TIMEOUT: &[u8] = b"ERROR: timed out";
pub const RESPONSE_INVALID_ID: &[u8] = b"ERROR: invalid homework id";
pub const RESPONSE_INVALID_IMAGE: &[u8] = b"ERROR: invalid image";
pub const RESPONSE_STORAGE_FAILURE: &[u8] = b"ERROR: storage failure";
pub const RESPONSE_BUSY: &[u8] = b"ERROR: server busy";

/// Bounds applied to a single upload.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Largest declared image length accepted.
    pub max_image_bytes: usize,
    /// Longest gap allowed between two reads that return data.
    pub idle_timeout: Duration,
    /// Longest time the whole frame may take to arrive.
    pub max_upload: Duration,
}

/// One fully received upload. `payload.len()` always equals the declared length.
#[derive(Debug)]
pub struct Frame {
    pub homework_id: String,
    pub payload: Vec<u8>,
}

/// Incremental reader for a single upload frame.
///
/// The three `read_*` steps must be called in order; [`FrameReader::read_frame`]
/// runs all of them.
pub struct FrameReader<R> {
    reader: R,
    limits: FrameLimits,
    deadline: Instant,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Start reading. The total upload deadline starts counting now.
    pub fn new(reader: R, limits: FrameLimits) -> Self {
        Self {
            reader,
            limits,
            deadline: Instant::now() + limits.max_upload,
        }
    }

    /// Read the fixed-width homework id field.
    ///
    /// Only checks that the bytes decode as UTF-8; format checks belong to
    /// [`validate`](super::identifier::validate).
    pub async fn read_identifier(&mut self) -> Result<String, UploadError> {
        let mut buf = [0u8; HOMEWORK_ID_LENGTH];
        self.fill_exact("homework id", &mut buf).await?;

        match std::str::from_utf8(&buf) {
            Ok(id) => Ok(id.to_string()),
            Err(_) => Err(UploadError::Protocol(format!(
                "homework id is not valid UTF-8: {:02x?}",
                buf
            ))),
        }
    }

    /// Read the declared image length and check it against the limits.
    ///
    /// Rejects before any payload buffer is allocated.
    pub async fn read_length(&mut self) -> Result<usize, UploadError> {
        let mut buf = [0u8; LENGTH_FIELD_SIZE];
        self.fill_exact("length", &mut buf).await?;

        let declared = u32::from_be_bytes(buf) as usize;
        if declared == 0 {
            return Err(UploadError::Protocol("declared image length is 0".to_string()));
        }
        if declared > self.limits.max_image_bytes {
            return Err(UploadError::Protocol(format!(
                "declared image length {} exceeds maximum {}",
                declared, self.limits.max_image_bytes
            )));
        }
        Ok(declared)
    }

    /// Accumulate exactly `declared` payload bytes.
    pub async fn read_payload(&mut self, declared: usize) -> Result<Vec<u8>, UploadError> {
        let mut payload = vec![0u8; declared];
        self.fill_exact("image", &mut payload).await?;
        Ok(payload)
    }

    /// Read a complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame, UploadError> {
        let homework_id = self.read_identifier().await?;
        let declared = self.read_length().await?;
        let payload = self.read_payload(declared).await?;
        Ok(Frame {
            homework_id,
            payload,
        })
    }

    /// Fill `buf` completely, one read at a time.
    ///
    /// Each read waits at most the idle timeout and never past the total
    /// deadline. End of stream before `buf` is full is an incomplete upload.
    async fn fill_exact(&mut self, field: &'static str, buf: &mut [u8]) -> Result<(), UploadError> {
        let mut filled = 0;

        while filled < buf.len() {
            let idle_deadline = Instant::now() + self.limits.idle_timeout;
            let (deadline, limit) = if idle_deadline < self.deadline {
                (idle_deadline, self.limits.idle_timeout)
            } else {
                (self.deadline, self.limits.max_upload)
            };

            match timeout_at(deadline, self.reader.read(&mut buf[filled..])).await {
                Err(_) => return Err(UploadError::Timeout(limit)),
                Ok(Ok(0)) => {
                    return Err(UploadError::IncompleteUpload {
                        field,
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => {
                    // A reset peer is just a disconnect as far as the upload goes.
                    debug!(
                        "Read failed after {} of {} {} bytes: {}",
                        filled,
                        buf.len(),
                        field,
                        e
                    );
                    return Err(UploadError::IncompleteUpload {
                        field,
                        expected: buf.len(),
                        received: filled,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Encode a frame the way clients send it.
///
/// `homework_id` is written as-is so callers can build deliberately bad frames.
pub fn encode_frame(homework_id: &[u8], payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let length = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("image of {} bytes does not fit the length field", payload.len()),
        )
    })?;

    let mut data = Vec::with_capacity(homework_id.len() + LENGTH_FIELD_SIZE + payload.len());
    data.extend_from_slice(homework_id);
    data.extend_from_slice(&length.to_be_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Write a complete frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    homework_id: &[u8],
    payload: &[u8],
) -> std::io::Result<()> {
    let data = encode_frame(homework_id, payload)?;
    writer.write_all(&data).await?;
    writer.flush().await
}
