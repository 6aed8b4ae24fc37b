//! Typed errors for the messaging pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed {phase} payload: {source}")]
    MalformedPayload {
        phase: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected phase '{0}' for this service")]
    UnexpectedPhase(String),
    #[error("no mailbox registered for address '{0}'")]
    UnknownAddress(String),
    #[error("mailbox for '{0}' is closed")]
    MailboxClosed(String),
}
