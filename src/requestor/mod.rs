use crate::alert::AlertEmitter;
use crate::config::Config;
use crate::error::HookError;
use crate::event::RequestorEventSender;
use crate::hook::{Hook, ResolvedHook};
use anyhow::Result;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use url::Url;

pub mod http;
pub mod retry;
pub mod ws;

#[cfg(test)]
mod tests;

pub use http::HttpRequestor;
pub use ws::WsRequestor;

/// Outbound message types on the application-control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    SessionNew,
    SessionRedirect,
    SessionReconnect,
    CallStatus,
    VerbStatus,
    VerbHook,
    JambonzError,
    LlmEvent,
    LlmToolCall,
    TtsStreamingEvent,
    TtsTokensResult,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::SessionNew => "session:new",
            MsgType::SessionRedirect => "session:redirect",
            MsgType::SessionReconnect => "session:reconnect",
            MsgType::CallStatus => "call:status",
            MsgType::VerbStatus => "verb:status",
            MsgType::VerbHook => "verb:hook",
            MsgType::JambonzError => "jambonz:error",
            MsgType::LlmEvent => "llm:event",
            MsgType::LlmToolCall => "llm:tool-call",
            MsgType::TtsStreamingEvent => "tts:streaming-event",
            MsgType::TtsTokensResult => "tts:tokens-result",
        }
    }

    /// Status and streaming notifications are fire-and-forget; everything
    /// else expects an ack within the response timeout.
    pub fn wants_ack(&self) -> bool {
        !matches!(
            self,
            MsgType::CallStatus
                | MsgType::VerbStatus
                | MsgType::JambonzError
                | MsgType::LlmEvent
                | MsgType::LlmToolCall
                | MsgType::TtsStreamingEvent
                | MsgType::TtsTokensResult
        )
    }

    /// Only these message types carry the `hook` field on the wire.
    pub fn includes_hook(&self) -> bool {
        matches!(
            self,
            MsgType::SessionNew
                | MsgType::SessionRedirect
                | MsgType::SessionReconnect
                | MsgType::CallStatus
                | MsgType::VerbHook
                | MsgType::LlmEvent
        )
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook returned: nothing, or a JSON document. A JSON array of verb
/// nodes is how applications redirect the call.
#[derive(Debug, Clone, PartialEq)]
pub enum HookResponse {
    Empty,
    Json(Value),
}

impl HookResponse {
    pub fn as_verbs(&self) -> Option<&Vec<Value>> {
        match self {
            HookResponse::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn from_ack_data(data: Value) -> Self {
        if data.is_null() {
            HookResponse::Empty
        } else {
            HookResponse::Json(data)
        }
    }
}

/// Configuration and identity shared by both transports. Fixed at
/// construction for the life of the requestor; a handover clones it with a
/// new base URL.
#[derive(Clone)]
pub struct RequestorCore {
    pub account_sid: String,
    pub call_sid: String,
    pub secret: Option<String>,
    pub base_url: Url,
    pub config: Arc<Config>,
    pub alerts: AlertEmitter,
    pub events: RequestorEventSender,
    pub http_pool: Arc<http::HttpClientPool>,
}

impl RequestorCore {
    pub fn resolve(&self, hook: &Hook) -> Result<ResolvedHook, HookError> {
        hook.resolve(&self.base_url)
    }

    /// `JB-Signature: t=<ts>,v1=<hmac_sha256_hex(secret, "<ts>.<body>")>`,
    /// attached when a signing secret is configured and the body is
    /// non-empty.
    pub fn signature(&self, body: &str) -> Option<String> {
        let secret = self.secret.as_deref()?;
        if body.is_empty() {
            return None;
        }
        let ts = chrono::Utc::now().timestamp();
        sign_payload(secret, ts, body).ok()
    }
}

pub fn sign_payload(secret: &str, ts: i64, body: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid hmac key: {}", e))?;
    mac.update(format!("{}.{}", ts, body).as_bytes());
    Ok(format!(
        "t={},v1={}",
        ts,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// The per-session application-control channel, over whichever transport
/// the current hook target implies. Swapped wholesale on handover.
#[derive(Clone)]
pub enum Requestor {
    Http(Arc<HttpRequestor>),
    Ws(Arc<WsRequestor>),
}

impl Requestor {
    /// Send one message to the application and await its reply (HTTP
    /// response body, or WS ack for ack-expecting types).
    pub async fn request(
        &self,
        msg_type: MsgType,
        hook: &Hook,
        params: Value,
        b3: Option<String>,
    ) -> Result<HookResponse, HookError> {
        match self {
            Requestor::Http(r) => r.request(msg_type, hook, params, b3).await,
            Requestor::Ws(r) => r.request(msg_type, hook, params, b3).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Requestor::Http(r) => r.close(),
            Requestor::Ws(r) => r.close().await,
        }
    }

    pub fn account_sid(&self) -> &str {
        match self {
            Requestor::Http(r) => &r.core.account_sid,
            Requestor::Ws(r) => r.account_sid(),
        }
    }

    /// The transport's own base URL, fixed at construction.
    pub fn base_url(&self) -> &Url {
        match self {
            Requestor::Http(r) => &r.core.base_url,
            Requestor::Ws(r) => &r.core.base_url,
        }
    }
}
