//! Transport envelope assembly.
//!
//! The pipeline never inspects telemetry payloads: item builders live outside
//! this crate and hand in pre-serialized bytes through [`TelemetryData`]. The
//! assembler wraps those bytes with routing metadata (timestamp,
//! instrumentation key, context tags) into the JSON shape the collector
//! expects, and nothing downstream of the assembler mutates an envelope.

use crate::clock::Clock;
use crate::error::PipelineError;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flat tag map produced by the (external) context provider.
pub type ContextTags = BTreeMap<String, String>;

/// Opaque telemetry payload owned by the caller.
///
/// `serialize` must return the payload's JSON bytes; the envelope embeds them
/// verbatim as `baseData`.
pub trait TelemetryData: Send + Sync {
    /// Logical envelope name routed to the collector.
    fn envelope_name(&self) -> &str;
    /// Schema discriminator for the payload (`baseType`).
    fn base_type(&self) -> &str;
    /// Serialized payload bytes (JSON).
    fn serialize(&self) -> Result<Vec<u8>, PipelineError>;
}

/// Schema-wrapped payload inside an envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeData {
    #[serde(rename = "baseType")]
    pub base_type: String,
    #[serde(rename = "baseData")]
    pub base_data: Box<RawValue>,
}

/// One telemetry item as transmitted: payload plus routing metadata.
///
/// Immutable after assembly; batches serialize these as a JSON array.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub ver: i32,
    pub name: String,
    pub time: String,
    #[serde(rename = "iKey")]
    pub ikey: String,
    pub tags: ContextTags,
    pub data: EnvelopeData,
}

/// Stateless envelope factory. Stamps time from the injected clock and the
/// configured instrumentation key.
#[derive(Debug, Clone)]
pub struct EnvelopeAssembler {
    ikey: String,
    clock: Arc<dyn Clock>,
}

impl EnvelopeAssembler {
    pub fn new(ikey: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self { ikey: ikey.into(), clock }
    }

    /// Wrap one payload and its tags into a transport envelope.
    pub fn assemble(
        &self,
        payload: &dyn TelemetryData,
        tags: ContextTags,
    ) -> Result<Envelope, PipelineError> {
        let bytes = payload.serialize()?;
        let json = String::from_utf8(bytes)
            .map_err(|e| PipelineError::InvalidPayload(format!("payload is not UTF-8: {}", e)))?;
        let base_data = RawValue::from_string(json)?;
        let time = self.clock.now_utc().to_rfc3339_opts(SecondsFormat::Millis, true);
        Ok(Envelope {
            ver: 1,
            name: payload.envelope_name().to_string(),
            time,
            ikey: self.ikey.clone(),
            tags,
            data: EnvelopeData { base_type: payload.base_type().to_string(), base_data },
        })
    }
}

/// Serialize a drained batch to the JSON array the sender transmits.
/// Array order is enqueue order.
pub fn serialize_batch(envelopes: &[Envelope]) -> Result<Vec<u8>, PipelineError> {
    Ok(serde_json::to_vec(envelopes)?)
}
