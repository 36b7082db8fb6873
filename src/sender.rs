//! Drains persisted batches and transmits them, classifying each response
//! into delete / requeue / drop.
//!
//! The sender talks to the wire through the [`Transport`] trait so the
//! classification logic stays unit-testable without a collector;
//! [`HttpTransport`] is the production implementation. Concurrency is bounded
//! by a semaphore: past the cap, [`Sender::send`] is a no-op until a slot
//! frees. The sender never raises to its caller: all outcomes are logged and
//! reflected only in file state transitions.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::persist::{PersistedFile, PersistenceStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What the sender got back from the wire.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Wire seam: one HTTP POST of a serialized batch.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        body: Vec<u8>,
        gzipped: bool,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, PipelineError>> + Send>>;
}

/// How a response (or its absence) disposes of the persisted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 200-202: the collector accepted the batch; delete the file.
    Accepted,
    /// Transient overload or outage; keep the file for a later cycle.
    Retry,
    /// The collector will never accept this payload; delete after one try.
    Drop,
}

/// Classify an HTTP status per the collector's retry contract.
pub fn classify_status(status: u16) -> Disposition {
    match status {
        200..=202 => Disposition::Accepted,
        408 | 429 | 500 | 503 | 511 => Disposition::Retry,
        _ => Disposition::Drop,
    }
}

/// Production transport: gzip-compressed JSON POST via reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()?;
        Ok(Self { client, endpoint: config.endpoint_url().to_string() })
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        body: Vec<u8>,
        gzipped: bool,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, PipelineError>> + Send>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let mut request = client.post(&endpoint).header(CONTENT_TYPE, "application/json");
            if gzipped {
                request = request.header(CONTENT_ENCODING, "gzip");
            }
            let response = request.body(body).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok(TransportResponse { status, body })
        })
    }
}

/// gzip-compress a batch body; `None` when the encoder fails, in which case
/// the sender falls back to the uncompressed bytes.
fn gzip(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}

/// Batch transmitter. Clones share the in-flight slot pool.
#[derive(Clone)]
pub struct Sender {
    store: Arc<PersistenceStore>,
    transport: Arc<dyn Transport>,
    slots: Arc<Semaphore>,
    developer_mode: bool,
}

impl Sender {
    pub fn new(
        store: Arc<PersistenceStore>,
        transport: Arc<dyn Transport>,
        max_in_flight: usize,
        developer_mode: bool,
    ) -> Self {
        Self { store, transport, slots: Arc::new(Semaphore::new(max_in_flight)), developer_mode }
    }

    /// Drain and transmit persisted batches until the backlog is empty, a
    /// response warrants waiting for the next cycle, or the in-flight cap is
    /// hit. Idempotent; callable from the timer loop and from flushes.
    ///
    /// File I/O runs on the blocking pool; the runtime thread only drives
    /// the transport.
    pub async fn send(&self) {
        loop {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("send skipped, in-flight cap reached");
                    return;
                }
            };

            let Some(Some((file, bytes))) = self.with_store(claim_next).await else {
                return;
            };

            let (body, gzipped) = match gzip(&bytes) {
                Some(compressed) => (compressed, true),
                None => (bytes.clone(), false),
            };

            let outcome = self.transport.post(body, gzipped).await;
            // Slot is released here, before any chained attempt.
            drop(permit);

            match outcome {
                Ok(response) => match classify_status(response.status) {
                    Disposition::Accepted => {
                        if self.developer_mode {
                            info!(status = response.status, body = %response.body, "batch accepted");
                        } else {
                            debug!(status = response.status, "batch accepted");
                        }
                        self.with_store(move |store| store.delete(&file)).await;
                        // Backlog may be deep after an outage; keep draining.
                        continue;
                    }
                    Disposition::Retry => {
                        warn!(
                            status = response.status,
                            payload = %String::from_utf8_lossy(&bytes),
                            "recoverable response, batch kept for retry"
                        );
                        self.with_store(move |store| store.make_available(&file)).await;
                        return;
                    }
                    Disposition::Drop => {
                        warn!(
                            status = response.status,
                            body = %response.body,
                            "batch rejected, deleting"
                        );
                        self.with_store(move |store| store.delete(&file)).await;
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "transport failure, batch kept for retry");
                    self.with_store(move |store| store.make_available(&file)).await;
                    return;
                }
            }
        }
    }

    /// Run one store operation on the blocking pool. `None` if the task was
    /// cancelled, which only happens at runtime shutdown.
    async fn with_store<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&PersistenceStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "storage task failed");
                None
            }
        }
    }
}

/// Claim the next readable, non-empty batch, discarding broken files along
/// the way.
fn claim_next(store: &PersistenceStore) -> Option<(PersistedFile, Vec<u8>)> {
    loop {
        let file = store.next_available()?;
        let bytes = match store.load(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %file.path().display(), error = %e, "unreadable batch file");
                store.delete(&file);
                continue;
            }
        };
        if bytes.is_empty() {
            debug!(file = %file.path().display(), "discarding empty batch file");
            store.delete(&file);
            continue;
        }
        return Some((file, bytes));
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("developer_mode", &self.developer_mode)
            .finish_non_exhaustive()
    }
}
