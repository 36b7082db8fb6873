//! Error type shared across the pipeline.
//!
//! Nothing here ever escapes to the application that recorded the telemetry:
//! every failure is logged and absorbed at the component boundary. The type
//! exists so components can propagate failures to each other with `?` before
//! the boundary swallows them.

/// Unified error for persistence, serialization, and transport failures.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Disk read/write/delete failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Envelope or batch serialization failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A payload handed to the assembler was not valid UTF-8 JSON.
    #[error("invalid telemetry payload: {0}")]
    InvalidPayload(String),

    /// HTTP request could not be built or completed (no response received).
    #[error("transport error: {0}")]
    Transport(String),

    /// The pipeline was constructed outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn storage_error_display_includes_source() {
        let err = PipelineError::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let msg = format!("{}", err);
        assert!(msg.contains("storage error"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn transport_error_display() {
        let err = PipelineError::Transport("connection refused".to_string());
        assert!(format!("{}", err).contains("connection refused"));
    }

    #[test]
    fn serialize_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = PipelineError::from(bad);
        assert!(matches!(err, PipelineError::Serialize(_)));
    }
}
