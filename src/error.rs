//! Error types for exec-assist.

use std::time::Duration;

/// Any failure the crate surfaces outside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Bad or missing environment settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Activity store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Could not open activity store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Calendar provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Calendar {provider} unreachable: {reason}")]
    Unreachable { provider: String, reason: String },

    #[error("Calendar {provider} returned {status}: {reason}")]
    RequestFailed {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from calendar {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Outbound email errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Mailer {provider} failed to send: {reason}")]
    SendFailed { provider: String, reason: String },
}

/// Inbound mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("IMAP connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("IMAP {command} rejected: {response}")]
    Rejected { command: String, response: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),
}

/// Pipeline stage failures.
///
/// None of these abort processing of a message: each one is folded into the
/// decision or the activity record by the processor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Email classification failed: {0}")]
    ClassificationFailure(String),

    #[error("Intent extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("Calendar unavailable: {0}")]
    CalendarUnavailable(String),

    #[error("Contradictory constraints: {0}")]
    ContradictoryConstraints(String),

    #[error("Delivery failed after {attempts} attempt(s): {reason}")]
    DeliveryFailure { attempts: u32, reason: String },

    #[error("Activity store write failed after {attempts} attempt(s): {reason}")]
    StoreWriteFailure { attempts: u32, reason: String },
}

