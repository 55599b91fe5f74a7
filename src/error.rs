//! Error types shared across the crate, following the corpus convention
//! of a `thiserror` enum per concern plus a `SafeDisplay` impl so logs
//! never leak credentials embedded in configuration values.

use thiserror::Error;

/// Like `Display`, but with secrets redacted. Config values (broker
/// passwords) implement this instead of `Display` directly.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to load configuration: {0}")]
    Config(String),

    #[error("broker connection failed: {0}")]
    BrokerConnect(String),

    #[error("broker connection dropped: {0}")]
    BrokerDisconnected(String),

    #[error("no processor registered for destination {0}")]
    UnknownDestination(String),

    #[error("malformed job message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Data file does not exist or is not readable: {0}")]
    DataFileUnreadable(String),

    #[error("worker spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("catalog request failed: {0}")]
    CatalogRequest(String),
}

impl SafeDisplay for AgentError {
    fn to_safe_string(&self) -> String {
        // None of the variants above embed credentials; they're already
        // safe to log verbatim. Kept as a trait impl (rather than reusing
        // Display) so config types below can redact without special-casing
        // call sites.
        self.to_string()
    }
}
