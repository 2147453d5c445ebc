//! # Connection Handler
//!
//! Owns one accepted connection from accept to close:
//!
//! ```text
//! Accepted -> ReadingIdentifier -> ReadingLength -> ReadingPayload -> Validating -> Storing -> Closed
//! ```
//!
//! Any failure jumps straight to `Closed`. Closing always happens in
//! [`ConnectionHandler::run`] after the upload attempt returns, whatever the
//! outcome: the fixed response is sent, the socket is shut down and dropped.
//! The payload buffer and any temp file are owned by the upload attempt and
//! are released when it returns.

use log::{debug, info, log, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::error::UploadError;
use crate::common::frame::{self, FrameLimits, FrameReader};
use crate::common::identifier::validate;
use crate::server::storage::Storage;

/// How long the server waits to deliver its one-line response.
const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Closing a socket with unread input resets it, which can destroy the
/// response in flight. Drain at most this long / this much before dropping.
const LINGER: Duration = Duration::from_millis(500);
const LINGER_MAX_BYTES: usize = 64 * 1024;

/// Handler progress, tracked for logging and for reporting where an upload died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    ReadingIdentifier,
    ReadingLength,
    ReadingPayload,
    Validating,
    Storing,
    Closed,
}

/// Process-wide context every handler receives from the listener.
#[derive(Debug)]
pub struct HandlerContext {
    pub storage: Storage,
    pub limits: FrameLimits,
    pub require_bmp: bool,
    pub processing_delay: Duration,
}

/// Result of one connection.
#[derive(Debug)]
pub struct UploadOutcome {
    /// Where the handler was when it finished (`Storing` on success).
    pub last_state: ConnectionState,
    pub result: Result<StoredUpload, UploadError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub homework_id: String,
    pub bytes: usize,
    pub path: PathBuf,
}

pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    ctx: Arc<HandlerContext>,
    state: ConnectionState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionHandler<S> {
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<HandlerContext>) -> Self {
        Self {
            stream,
            peer,
            ctx,
            state: ConnectionState::Accepted,
        }
    }

    /// Process the connection to completion and close it.
    pub async fn run(mut self) -> UploadOutcome {
        debug!("Client {} connected", self.peer);

        let result = self.upload().await;
        let last_state = self.state;

        match &result {
            Ok(stored) => info!(
                "Stored {} bytes for {} from {} at {}",
                stored.bytes,
                stored.homework_id,
                self.peer,
                stored.path.display()
            ),
            Err(e) => log!(
                e.log_level(),
                "Upload from {} failed while {:?}: {}",
                self.peer,
                last_state,
                e
            ),
        }

        let response = match &result {
            Ok(_) => frame::RESPONSE_SUCCESS,
            Err(e) => e.response(),
        };
        self.close(response).await;

        UploadOutcome { last_state, result }
    }

    /// Steps through the states up to `Storing`. Everything allocated here
    /// is dropped on return.
    async fn upload(&mut self) -> Result<StoredUpload, UploadError> {
        let ctx = Arc::clone(&self.ctx);
        let mut reader = FrameReader::new(&mut self.stream, ctx.limits);

        self.state = ConnectionState::ReadingIdentifier;
        let candidate = reader.read_identifier().await?;

        self.state = ConnectionState::ReadingLength;
        let declared = reader.read_length().await?;
        debug!("{} declared {} bytes for {:?}", self.peer, declared, candidate);

        self.state = ConnectionState::ReadingPayload;
        let payload = reader.read_payload(declared).await?;

        self.state = ConnectionState::Validating;
        let id = validate(&candidate)?;
        if ctx.require_bmp {
            check_bmp(&payload)?;
        }

        if !ctx.processing_delay.is_zero() {
            debug!("Delaying {} for {:?}", id, ctx.processing_delay);
            tokio::time::sleep(ctx.processing_delay).await;
        }

        self.state = ConnectionState::Storing;
        let bytes = payload.len();
        let path = ctx.storage.store_async(id.clone(), payload).await?;

        Ok(StoredUpload {
            homework_id: id.to_string(),
            bytes,
            path,
        })
    }

    async fn close(mut self, response: &[u8]) {
        let send = async {
            self.stream.write_all(response).await?;
            self.stream.flush().await?;
            self.stream.shutdown().await
        };
        match tokio::time::timeout(RESPONSE_WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Could not send response to {}: {}", self.peer, e),
            Err(_) => warn!("Response to {} timed out", self.peer),
        }
        linger(&mut self.stream).await;
        self.state = ConnectionState::Closed;
        debug!("Connection from {} {:?}", self.peer, self.state);
    }
}

/// Read and discard whatever the client still sends, until EOF or the linger bound.
async fn linger<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut buf = [0u8; 4096];
    let mut drained = 0;
    let _ = tokio::time::timeout(LINGER, async {
        while drained < LINGER_MAX_BYTES {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    })
    .await;
}

fn check_bmp(payload: &[u8]) -> Result<(), UploadError> {
    match image::guess_format(payload) {
        Ok(image::ImageFormat::Bmp) => Ok(()),
        Ok(other) => Err(UploadError::InvalidImage(format!(
            "expected BMP, got {:?}",
            other
        ))),
        Err(_) => Err(UploadError::InvalidImage(
            "payload does not start with a BMP header".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    fn context(root: &std::path::Path, require_bmp: bool) -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            storage: Storage::open(root).unwrap(),
            limits: FrameLimits {
                max_image_bytes: 64,
                idle_timeout: Duration::from_millis(200),
                max_upload: Duration::from_secs(5),
            },
            require_bmp,
            processing_delay: Duration::ZERO,
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn exchange(
        ctx: Arc<HandlerContext>,
        data: Vec<u8>,
        close_after: bool,
    ) -> (UploadOutcome, Vec<u8>) {
        let (mut client, server): (DuplexStream, DuplexStream) = duplex(1024);
        let handler = tokio::spawn(ConnectionHandler::new(server, peer(), ctx).run());

        client.write_all(&data).await.unwrap();
        if close_after {
            client.shutdown().await.unwrap();
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        drop(client);
        (handler.await.unwrap(), response)
    }

    #[tokio::test]
    async fn test_successful_upload() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), false);
        let data = frame::encode_frame(b"ABC123456", &[1, 2, 3, 4]).unwrap();

        let (outcome, response) = exchange(Arc::clone(&ctx), data, false).await;

        assert_eq!(response, frame::RESPONSE_SUCCESS);
        assert_eq!(outcome.last_state, ConnectionState::Storing);
        let stored = outcome.result.unwrap();
        assert_eq!(stored.bytes, 4);
        assert_eq!(
            std::fs::read(dir.path().join("ABC123456").join("latest.bmp")).unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_traversal_id_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("photos");
        std::fs::create_dir(&root).unwrap();
        let ctx = context(&root, false);
        let data = frame::encode_frame(b"../../etc", &[1, 2, 3]).unwrap();

        let (outcome, response) = exchange(ctx, data, false).await;

        assert_eq!(response, frame::RESPONSE_INVALID_ID);
        assert_eq!(outcome.last_state, ConnectionState::Validating);
        assert!(matches!(
            outcome.result,
            Err(UploadError::ValidationRejected { .. })
        ));
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_truncated_upload_leaves_previous_image() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), false);
        let id = validate("ABCDEF123").unwrap();
        ctx.storage.store(&id, b"previous").unwrap();

        let mut data = frame::encode_frame(b"ABCDEF123", &[5; 20]).unwrap();
        data.truncate(data.len() - 10);
        let (outcome, response) = exchange(Arc::clone(&ctx), data, true).await;

        assert_eq!(response, frame::RESPONSE_INCOMPLETE);
        assert_eq!(outcome.last_state, ConnectionState::ReadingPayload);
        assert_eq!(ctx.storage.load(&id).unwrap(), Some(b"previous".to_vec()));
    }

    #[tokio::test]
    async fn test_storage_failure_reported_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), false);
        let id = validate("ABC123456").unwrap();
        // A directory where the image belongs makes the final rename fail.
        std::fs::create_dir_all(ctx.storage.image_path(&id)).unwrap();

        let data = frame::encode_frame(b"ABC123456", &[1, 2, 3]).unwrap();
        let (outcome, response) = exchange(Arc::clone(&ctx), data, false).await;

        assert_eq!(response, frame::RESPONSE_STORAGE_FAILURE);
        assert_eq!(outcome.last_state, ConnectionState::Storing);
        assert!(matches!(outcome.result, Err(UploadError::Storage(_))));

        let entries: Vec<String> = std::fs::read_dir(ctx.storage.slot_path(&id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["latest.bmp".to_string()]);
    }

    #[tokio::test]
    async fn test_oversized_declaration() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), false);
        let data = frame::encode_frame(b"ABC123456", &[0; 65]).unwrap();

        let (outcome, response) = exchange(ctx, data, false).await;

        assert_eq!(response, frame::RESPONSE_MALFORMED);
        assert_eq!(outcome.last_state, ConnectionState::ReadingLength);
        assert!(!dir.path().join("ABC123456").exists());
    }

    #[tokio::test]
    async fn test_bmp_check() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), true);

        let data = frame::encode_frame(b"ABC123456", b"PNG not really").unwrap();
        let (outcome, response) = exchange(Arc::clone(&ctx), data, false).await;
        assert_eq!(response, frame::RESPONSE_INVALID_IMAGE);
        assert!(matches!(outcome.result, Err(UploadError::InvalidImage(_))));

        let mut bmp = b"BM".to_vec();
        bmp.extend_from_slice(&[0; 30]);
        let data = frame::encode_frame(b"ABC123456", &bmp).unwrap();
        let (outcome, response) = exchange(ctx, data, false).await;
        assert_eq!(response, frame::RESPONSE_SUCCESS);
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), false);

        let (outcome, response) = exchange(ctx, b"ABC".to_vec(), false).await;

        assert_eq!(response, frame::RESPONSE_TIMEOUT);
        assert_eq!(outcome.last_state, ConnectionState::ReadingIdentifier);
        assert!(matches!(outcome.result, Err(UploadError::Timeout(_))));
    }
}
