use thiserror::Error;

/// Failure modes of a webhook request, over either transport.
///
/// The variant determines retry eligibility (see
/// [`crate::requestor::retry::RetryPolicy`]): transport and handshake
/// failures match the `ct` token, ack timeouts match `rt`, HTTP status
/// failures match `4xx`/`5xx`.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("webhook returned status {code}")]
    Status { code: u16 },

    #[error("timed out waiting for application response")]
    ResponseTimeout,

    #[error("websocket handshake rejected{}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Handshake { status: Option<u16> },

    #[error("malformed frame from application: {0}")]
    Protocol(String),

    #[error("outbound message queue overflow")]
    QueueOverflow,

    #[error("requestor has no live connection")]
    NotConnected,

    #[error("invalid hook: {0}")]
    InvalidHook(String),
}

impl HookError {
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        HookError::Transport(err.to_string())
    }
}

/// Errors raised while driving a call session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The task cannot run given the current call state. Terminal for the
    /// task; the session skips it and advances.
    #[error("precondition {precondition} not satisfiable for {task}: {reason}")]
    Precondition {
        task: &'static str,
        precondition: &'static str,
        reason: String,
    },

    /// Verb-specific failure, reported through the action hook when one is
    /// configured. The session continues unless the task is terminal.
    #[error("task {task} failed: {reason}")]
    Task { task: &'static str, reason: String },

    /// Signalling hangup or local termination. Fatal; teardown runs.
    #[error("session terminated: {0}")]
    Terminated(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_display_with_status() {
        let e = HookError::Handshake { status: Some(401) };
        assert_eq!(e.to_string(), "websocket handshake rejected (401)");
        let e = HookError::Handshake { status: None };
        assert_eq!(e.to_string(), "websocket handshake rejected");
    }
}
