use crate::get_timestamp;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// User-visible problem classes surfaced to account owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    WebhookConnectionFailure,
    WebhookStatusFailure,
    InvalidAppPayload,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::WebhookConnectionFailure => "WEBHOOK_CONNECTION_FAILURE",
            AlertKind::WebhookStatusFailure => "WEBHOOK_STATUS_FAILURE",
            AlertKind::InvalidAppPayload => "INVALID_APP_PAYLOAD",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub account_sid: String,
    pub call_sid: Option<String>,
    pub detail: String,
    pub timestamp: u64,
}

/// Fire-and-forget alert channel. Emission never blocks the call and never
/// fails it; when nobody is draining the channel the alert is still logged
/// and counted.
#[derive(Clone)]
pub struct AlertEmitter {
    tx: Option<mpsc::UnboundedSender<Alert>>,
}

impl AlertEmitter {
    /// Emitter that only logs and counts.
    pub fn logging() -> Self {
        Self { tx: None }
    }

    /// Emitter that additionally forwards alerts to a drain, for persistence
    /// layers and tests.
    pub fn with_sink() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, kind: AlertKind, account_sid: &str, call_sid: Option<&str>, detail: &str) {
        warn!(account_sid, call_sid, alert = kind.as_str(), "{}", detail);
        crate::metrics::alerts::raised(kind.as_str());
        if let Some(tx) = &self.tx {
            let _ = tx.send(Alert {
                kind,
                account_sid: account_sid.to_string(),
                call_sid: call_sid.map(|s| s.to_string()),
                detail: detail.to_string(),
                timestamp: get_timestamp(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_sink() {
        let (emitter, mut rx) = AlertEmitter::with_sink();
        emitter.emit(
            AlertKind::InvalidAppPayload,
            "acct-1",
            Some("call-1"),
            "binary frame",
        );
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.kind, AlertKind::InvalidAppPayload);
        assert_eq!(alert.account_sid, "acct-1");
        assert_eq!(alert.call_sid.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_emit_without_sink_does_not_panic() {
        AlertEmitter::logging().emit(AlertKind::WebhookStatusFailure, "acct-1", None, "503");
    }
}
