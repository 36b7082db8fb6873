#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # blackbox 📦
//!
//! Crash-safe telemetry delivery for Rust applications: record events from
//! any thread without blocking, and let the pipeline batch, persist, and
//! transmit them, surviving process crashes and transient network failures.
//!
//! ## Pipeline
//!
//! - **Queue** buffers envelopes in memory and turns them into batches on a
//!   count threshold, a one-shot timer, or an explicit flush
//! - **Persistence** writes each batch to a priority-segmented file store,
//!   capped per directory so a sustained outage can't eat the disk
//! - **Sender** drains persisted batches over gzip-compressed HTTP and
//!   classifies every response: accepted batches are deleted, transient
//!   failures retried, permanent rejections dropped
//! - **Session manager** stamps every item with a renewing session id that
//!   survives restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blackbox::{ContextTags, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder("your-instrumentation-key", "/var/lib/myapp")
//!         .build()?;
//!     let pipeline = Pipeline::builder(config).build()?;
//!
//!     // `payload` is any type implementing `TelemetryData`
//!     # let payload = blackbox::doc_support::ExamplePayload;
//!     pipeline.track(&payload, ContextTags::new());
//!
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod persist;
pub mod queue;
pub mod sender;
pub mod session;

// Re-exports
pub use channel::{Pipeline, PipelineBuilder, TelemetryChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PipelineConfig, PipelineConfigBuilder, DEFAULT_ENDPOINT};
pub use envelope::{ContextTags, Envelope, EnvelopeAssembler, TelemetryData};
pub use error::PipelineError;
pub use persist::{PersistedFile, PersistenceStore};
pub use queue::TransmitQueue;
pub use sender::{classify_status, Disposition, HttpTransport, Sender, Transport, TransportResponse};
pub use session::{
    FileSessionStore, MemorySessionStore, PersistedSession, SessionManager, SessionStore,
    SessionTags,
};

/// Doctest support only; not part of the API surface.
#[doc(hidden)]
pub mod doc_support {
    use crate::{PipelineError, TelemetryData};

    pub struct ExamplePayload;

    impl TelemetryData for ExamplePayload {
        fn envelope_name(&self) -> &str {
            "Microsoft.ApplicationInsights.Event"
        }
        fn base_type(&self) -> &str {
            "EventData"
        }
        fn serialize(&self) -> Result<Vec<u8>, PipelineError> {
            Ok(b"{\"name\":\"example\"}".to_vec())
        }
    }
}
