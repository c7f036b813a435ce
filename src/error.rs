//! Error handling for edge-arbiter
//!
//! This module defines the crate error type and a Result alias used by every
//! component. Contention and transport errors are recovered locally by their
//! callers; configuration errors are only fatal at startup.
//!
//! Frame release has no error variant: a captured frame is released by its
//! owning handle's `Drop`.

use crate::types::SourceId;
use thiserror::Error;

/// Main error type for edge-arbiter operations
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// The shared accelerator could not be acquired within the allowed wait
    #[error("Accelerator contention for source {source_id}: {message}")]
    ResourceContention { source_id: SourceId, message: String },

    /// A publish attempt failed
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A gap was observed in a source's sequence numbers
    #[error("Sequence gap on source {source_id}: expected {expected}, received {received} ({gap} missing)")]
    SequenceGap {
        source_id: SourceId,
        expected: u32,
        received: u32,
        gap: u32,
    },

    /// Configuration failed validation or could not be loaded
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The capture collaborator could not produce a frame
    #[error("Capture error: {0}")]
    Capture(String),

    /// The inference collaborator failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// A pipeline stage failed during init or processing
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ArbiterError>,
    },
}

impl ArbiterError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ArbiterError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a stage error
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ArbiterError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether a retry at a later time may succeed
    ///
    /// Context wrappers are looked through so callers can classify errors
    /// that have already been annotated.
    pub fn is_transient(&self) -> bool {
        match self {
            ArbiterError::TransportFailure(_)
            | ArbiterError::Timeout(_)
            | ArbiterError::ResourceContention { .. }
            | ArbiterError::Channel(_) => true,
            ArbiterError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ArbiterError {
    fn from(err: serde_json::Error) -> Self {
        ArbiterError::Serialization(err.to_string())
    }
}

/// Result type alias for edge-arbiter operations
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArbiterError::ConfigInvalid("slot_duration_ms must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: slot_duration_ms must be > 0"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = ArbiterError::TransportFailure("link down".to_string());
        let with_ctx = err.with_context("Failed to publish tick 7");
        assert!(with_ctx.to_string().contains("Failed to publish tick 7"));
        assert!(with_ctx.to_string().contains("link down"));
    }

    #[test]
    fn test_sequence_gap_display() {
        let err = ArbiterError::SequenceGap {
            source_id: SourceId::new("cam1"),
            expected: 13,
            received: 14,
            gap: 1,
        };
        let text = err.to_string();
        assert!(text.contains("cam1"));
        assert!(text.contains("expected 13"));
        assert!(text.contains("(1 missing)"));
    }

    #[test]
    fn test_transient_classification_sees_through_context() {
        let err = ArbiterError::Timeout("publish".into()).with_context("tick 3");
        assert!(err.is_transient());
        assert!(!ArbiterError::ConfigInvalid("x".into()).is_transient());
        assert!(!ArbiterError::Serialization("bad".into()).is_transient());
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<()> = Err(ArbiterError::Capture("no frame".into()));
        let err = result.context("tick 12").unwrap_err();
        assert!(matches!(err, ArbiterError::WithContext { .. }));
    }
}
