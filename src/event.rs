use crate::requestor::Requestor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// An asynchronous command pushed by the application over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCommand {
    pub command: String,
    #[serde(default)]
    pub msgid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default, rename = "queueCommand")]
    pub queue_command: bool,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Events a requestor surfaces to its owning session.
pub enum RequestorEvent {
    /// An inbound `command` frame from the application.
    Command(AppCommand),
    /// The target hook implied a different transport; the session should
    /// swap to the new requestor.
    Handover(Requestor),
    /// The underlying connection is gone and will not come back.
    ConnectionDropped { reason: String },
}

impl std::fmt::Debug for RequestorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestorEvent::Command(cmd) => f.debug_tuple("Command").field(&cmd.command).finish(),
            RequestorEvent::Handover(_) => f.write_str("Handover"),
            RequestorEvent::ConnectionDropped { reason } => f
                .debug_struct("ConnectionDropped")
                .field("reason", reason)
                .finish(),
        }
    }
}

pub type RequestorEventSender = mpsc::UnboundedSender<RequestorEvent>;
pub type RequestorEventReceiver = mpsc::UnboundedReceiver<RequestorEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_deserialize_defaults() {
        let cmd: AppCommand = serde_json::from_value(json!({"command": "redirect"})).unwrap();
        assert_eq!(cmd.command, "redirect");
        assert!(!cmd.queue_command);
        assert!(cmd.data.is_null());
    }

    #[test]
    fn test_command_queue_flag_camel_case() {
        let cmd: AppCommand =
            serde_json::from_value(json!({"command": "redirect", "queueCommand": true})).unwrap();
        assert!(cmd.queue_command);
    }
}
