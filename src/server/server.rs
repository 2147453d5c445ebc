//! # Listener / Dispatcher
//!
//! Accepts connections forever and gives each one its own tokio task, so a
//! stalled client only ever holds up its own handler. A semaphore caps the
//! number of handlers alive at once. Connections over the cap are answered
//! inline and dropped, so they never hold a task or a descriptor past accept.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::common::frame::RESPONSE_BUSY;
use crate::server::config::{IngestConfig, OverloadPolicy};
use crate::server::connection::{ConnectionHandler, HandlerContext};
use crate::server::metrics::IngestStats;
use crate::server::storage::Storage;

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct IngestServer {
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    slots: Arc<Semaphore>,
    policy: OverloadPolicy,
    stats: IngestStats,
}

impl IngestServer {
    /// Check the config and storage root, then bind the listener.
    ///
    /// Every error here is a startup failure: the caller should report it
    /// and exit non-zero.
    pub async fn bind(config: &IngestConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let storage = Storage::open(&config.storage.root)?;

        let listener = TcpListener::bind(&config.server.address)
            .await
            .with_context(|| format!("failed to bind to {}", config.server.address))?;

        let ctx = Arc::new(HandlerContext {
            storage,
            limits: config.frame_limits(),
            require_bmp: config.protocol.require_bmp,
            processing_delay: config.processing_delay(),
        });

        Ok(Self {
            listener,
            ctx,
            slots: Arc::new(Semaphore::new(config.server.max_connections)),
            policy: config.server.overload_policy,
            stats: IngestStats::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the counters; stays live after `run` takes `self`.
    pub fn stats(&self) -> IngestStats {
        self.stats.clone()
    }

    /// Accept connections until the process is killed.
    pub async fn run(self) {
        info!(
            "Image server running on tcp://{} (max {} connections, storage {})",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.slots.available_permits(),
            self.ctx.storage.root().display()
        );

        loop {
            // Under `Wait`, hold off accepting until a slot is free so the
            // backlog lives in the kernel, not in this process.
            let reserved = match self.policy {
                OverloadPolicy::Wait => match Arc::clone(&self.slots).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!("Connection limiter closed, stopping listener");
                        return;
                    }
                },
                OverloadPolicy::Reject => None,
            };

            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            self.stats.record_accepted();

            let permit = match reserved {
                Some(permit) => permit,
                None => match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("At connection limit, turning away {}", addr);
                        self.stats.record_rejected_busy();
                        reject_busy(socket, addr);
                        continue;
                    }
                },
            };

            self.dispatch(socket, addr, permit);
        }
    }

    fn dispatch(&self, socket: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let ctx = Arc::clone(&self.ctx);
        let stats = self.stats.clone();

        tokio::spawn(async move {
            // Both released when this task ends, even if the handler panics.
            let _permit = permit;
            let _active = stats.handler_started();

            let handler = tokio::spawn(ConnectionHandler::new(socket, addr, ctx).run());
            match handler.await {
                Ok(outcome) => stats.record_outcome(outcome.result.is_ok()),
                Err(e) => {
                    stats.record_outcome(false);
                    error!("Handler for {} crashed: {}", addr, e);
                }
            }
            debug!("Stats after {}: {:?}", addr, stats.snapshot());
        });
    }
}

/// Send the busy response without waiting and close.
///
/// A fresh socket's send buffer always has room for the response, so a
/// single non-blocking write is enough. The socket drops on return.
fn reject_busy(socket: TcpStream, addr: SocketAddr) {
    match socket.try_write(RESPONSE_BUSY) {
        Ok(n) if n == RESPONSE_BUSY.len() => {}
        Ok(n) => debug!("Busy response to {} cut short at {} bytes", addr, n),
        Err(e) => debug!("Could not send busy response to {}: {}", addr, e),
    }
}
