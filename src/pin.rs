//! Local pinning.
//!
//! [`PinWorker`] is the default [`PinExecutor`]: every submission runs on its
//! own task, at most `max_concurrent` at a time, and reports exactly one
//! status over a oneshot channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::debug;

use crate::core::PinExecutor;

/// Status reported for a successful pin.
pub const PIN_OK: &str = "OK";

/// The operation that durably retains content for a key.
#[async_trait]
pub trait Pinner: Send + Sync + 'static {
    async fn pin(&self, key: &[u8]) -> Result<()>;
}

/// In-memory pin set. Pinning never fails.
#[derive(Default)]
pub struct LocalPinSet {
    pinned: Mutex<BTreeSet<Vec<u8>>>,
}

impl LocalPinSet {
    pub async fn is_pinned(&self, key: &[u8]) -> bool {
        self.pinned.lock().await.contains(key)
    }
}

#[async_trait]
impl Pinner for LocalPinSet {
    async fn pin(&self, key: &[u8]) -> Result<()> {
        self.pinned.lock().await.insert(key.to_vec());
        Ok(())
    }
}

/// Runs a [`Pinner`] on spawned tasks, bounded by a semaphore.
///
/// Must be used from within a tokio runtime.
pub struct PinWorker<P: Pinner> {
    pinner: Arc<P>,
    permits: Arc<Semaphore>,
}

impl<P: Pinner> PinWorker<P> {
    pub fn new(pinner: Arc<P>, max_concurrent: usize) -> Self {
        Self {
            pinner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

impl<P: Pinner> PinExecutor for PinWorker<P> {
    fn submit(&self, key: Vec<u8>) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let pinner = self.pinner.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let status = match permits.acquire_owned().await {
                Ok(_permit) => match pinner.pin(&key).await {
                    Ok(()) => PIN_OK.to_string(),
                    Err(err) => format!("{err:#}"),
                },
                Err(_) => "pin worker closed".to_string(),
            };
            debug!(key = %hex::encode(&key), %status, "pin finished");
            // The submitter may have given up waiting.
            let _ = tx.send(status);
        });
        rx
    }
}
