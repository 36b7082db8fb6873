//! Pipeline assembly and the single entry point telemetry flows through.
//!
//! [`Pipeline`] owns every component explicitly (queue, store, sender,
//! session manager) and wires them at construction; there are no process
//! globals and no lazy initialization. [`TelemetryChannel`] is the narrow
//! handle a tracking façade calls: one `enqueue`, plus the crash flag that
//! reroutes writes straight to disk.

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::envelope::{serialize_batch, ContextTags, Envelope, EnvelopeAssembler, TelemetryData};
use crate::error::PipelineError;
use crate::persist::PersistenceStore;
use crate::queue::TransmitQueue;
use crate::sender::{HttpTransport, Sender, Transport};
use crate::session::{FileSessionStore, SessionManager, SessionStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Entry point for assembled envelopes. Clones share the underlying queue,
/// store, and crash flag.
#[derive(Debug, Clone)]
pub struct TelemetryChannel {
    queue: TransmitQueue,
    store: Arc<PersistenceStore>,
    crashing: Arc<AtomicBool>,
}

impl TelemetryChannel {
    /// Route one envelope into the pipeline.
    ///
    /// Normal path: buffer in the queue (timer/count triggers apply). Crash
    /// path: serialize and persist a one-envelope batch at high priority,
    /// synchronously on this thread, because the queue's timers and workers
    /// may never run again.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.crashing.load(Ordering::SeqCst) {
            let bytes = match serialize_batch(std::slice::from_ref(&envelope)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "failed to serialize crash envelope");
                    return false;
                }
            };
            return self.store.persist(&bytes, true);
        }
        self.queue.enqueue(envelope)
    }

    /// Flag the process as crashing: pending items flush synchronously at
    /// high priority and subsequent enqueues bypass the queue entirely.
    pub fn mark_crashing(&self) {
        self.crashing.store(true, Ordering::SeqCst);
        self.queue.flush_sync(true);
        info!("crash flag set, telemetry now persists synchronously");
    }

    pub fn is_crashing(&self) -> bool {
        self.crashing.load(Ordering::SeqCst)
    }
}

/// Builder wiring the pipeline's seams; production defaults are the system
/// clock, the HTTP transport, and the file-backed session store.
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    session_store: Option<Arc<dyn SessionStore>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, clock: None, transport: None, session_store: None }
    }

    /// Override the clock (deterministic session/timestamp tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the wire transport (tests run without a collector).
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the session store.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Construct the fully wired pipeline. Must be called within a tokio
    /// runtime: the queue's flush timer and the send loop are spawned on it.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Runtime(e.to_string()))?;
        let config = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = Arc::new(PersistenceStore::new(config.storage_root(), config.max_file_count())?);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let session_store: Arc<dyn SessionStore> = self
            .session_store
            .unwrap_or_else(|| Arc::new(FileSessionStore::new(config.storage_root())));

        let crashing = Arc::new(AtomicBool::new(false));
        let queue = TransmitQueue::new(
            store.clone(),
            handle.clone(),
            config.max_batch_count(),
            config.max_batch_interval(),
            config.telemetry_disabled(),
            crashing.clone(),
        );
        let sender = Sender::new(
            store.clone(),
            transport,
            config.max_in_flight(),
            config.developer_mode(),
        );
        let session = SessionManager::new(
            session_store,
            clock.clone(),
            config.session_expiration(),
            config.session_renewal(),
        );
        let assembler = EnvelopeAssembler::new(config.instrumentation_key(), clock);
        let channel = TelemetryChannel { queue: queue.clone(), store, crashing };

        let pipeline = Pipeline {
            config,
            channel,
            queue,
            sender,
            session: Arc::new(session),
            assembler,
            send_loop: Mutex::new(None),
        };
        pipeline.start_send_loop(&handle);
        Ok(pipeline)
    }
}

/// Top-level owner of the delivery pipeline.
///
/// Construct with [`Pipeline::builder`]; drop-in collaborators (payload
/// builders, context providers) stay outside the crate and reach the
/// pipeline through [`Pipeline::track`] or [`Pipeline::channel`].
pub struct Pipeline {
    config: PipelineConfig,
    channel: TelemetryChannel,
    queue: TransmitQueue,
    sender: Sender,
    session: Arc<SessionManager>,
    assembler: EnvelopeAssembler,
    send_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Assemble an envelope (stamping session tags) and route it through the
    /// channel. Returns `false` when telemetry is disabled or assembly
    /// failed; never raises.
    pub fn track(&self, payload: &dyn TelemetryData, mut tags: ContextTags) -> bool {
        self.session.session_tags().apply(&mut tags);
        match self.assembler.assemble(payload, tags) {
            Ok(envelope) => self.channel.enqueue(envelope),
            Err(e) => {
                if self.config.developer_mode() {
                    error!(error = %e, "failed to assemble envelope");
                } else {
                    debug!(error = %e, "failed to assemble envelope");
                }
                false
            }
        }
    }

    /// Handle for an external façade to push pre-assembled envelopes.
    pub fn channel(&self) -> TelemetryChannel {
        self.channel.clone()
    }

    /// Session context for the current access (renewal check included).
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Force the queue's buffered envelopes to persistence now.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Run one send cycle immediately instead of waiting for the cadence.
    pub async fn trigger_send(&self) {
        self.sender.send().await;
    }

    /// Flag the process as crashing (see [`TelemetryChannel::mark_crashing`]).
    pub fn mark_crashing(&self) {
        self.channel.mark_crashing();
    }

    /// Toggle telemetry at runtime.
    pub fn set_telemetry_disabled(&self, disabled: bool) {
        self.queue.set_disabled(disabled);
    }

    /// Stop the send loop, flush what is buffered, and run a final send
    /// pass. Call before process exit to minimize the backlog left on disk.
    pub async fn shutdown(&self) {
        let task = match self.send_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.queue.flush_sync(false);
        self.sender.send().await;
        info!("pipeline shut down");
    }

    fn start_send_loop(&self, handle: &tokio::runtime::Handle) {
        let sender = self.sender.clone();
        let interval = self.config.send_interval();
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so startup isn't a send.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sender.send().await;
            }
        });
        if let Ok(mut guard) = self.send_loop.lock() {
            *guard = Some(task);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.send_loop.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("config", &self.config).finish_non_exhaustive()
    }
}
