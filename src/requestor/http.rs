use super::retry::RetryPolicy;
use super::{HookResponse, MsgType, Requestor, RequestorCore, WsRequestor};
use crate::alert::AlertKind;
use crate::config::Config;
use crate::error::HookError;
use crate::event::RequestorEvent;
use crate::hook::{Hook, HookMethod, ResolvedHook};
use crate::utils::snakecase_keys;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const POOL_IDLE_TTL: Duration = Duration::from_secs(60);

struct PoolEntry {
    client: reqwest::Client,
    last_used: Instant,
}

/// Keep-alive client registry, one pooled client per origin
/// (scheme+host+port). Entries idle past the TTL are evicted on access.
/// Shared process-wide; sessions receive it through the app context.
pub struct HttpClientPool {
    config: Arc<Config>,
    clients: Mutex<HashMap<String, PoolEntry>>,
}

impl HttpClientPool {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, url: &Url) -> Result<reqwest::Client, HookError> {
        if !self.config.http_pool {
            return self.build_client(0);
        }
        let origin = format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or(0)
        );
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|_, entry| entry.last_used.elapsed() < POOL_IDLE_TTL);
        if let Some(entry) = clients.get_mut(&origin) {
            entry.last_used = Instant::now();
            return Ok(entry.client.clone());
        }
        let max_idle = self.config.http_poolsize * self.config.http_pipelining.max(1);
        let client = self.build_client(max_idle)?;
        debug!(origin, "created webhook client pool");
        clients.insert(
            origin,
            PoolEntry {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    pub fn pooled_origins(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn build_client(&self, max_idle: usize) -> Result<reqwest::Client, HookError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.http_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(POOL_IDLE_TTL);
        if let Some(proxy) = self.config.proxy_url() {
            builder = builder.proxy(reqwest::Proxy::all(&proxy).map_err(HookError::transport)?);
        }
        builder.build().map_err(HookError::transport)
    }
}

/// Webhook client over HTTP(S). One per session while the application is
/// HTTP-controlled; replaced through handover when a hook points at a
/// `ws://`/`wss://` target.
pub struct HttpRequestor {
    pub core: RequestorCore,
    closed: AtomicBool,
}

impl HttpRequestor {
    pub fn new(core: RequestorCore) -> Arc<Self> {
        Arc::new(Self {
            core,
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn request(
        self: &Arc<Self>,
        msg_type: MsgType,
        hook: &Hook,
        params: Value,
        b3: Option<String>,
    ) -> Result<HookResponse, HookError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(HookResponse::Empty);
        }
        let resolved = self.core.resolve(hook)?;
        if resolved.scheme.is_ws() {
            return self.handover_to_ws(msg_type, &resolved, params).await;
        }
        // websocket-only diagnostics have no meaning over HTTP
        if msg_type == MsgType::JambonzError {
            return Ok(HookResponse::Empty);
        }

        let policy = RetryPolicy::from_override(&resolved.retry, 1);
        let body = serde_json::to_string(&snakecase_keys(&params))
            .map_err(|e| HookError::Protocol(e.to_string()))?;

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            crate::metrics::webhook::attempt("http");
            let started = Instant::now();
            let result = self.send_once(&resolved, &body, b3.as_deref()).await;
            crate::metrics::webhook::latency("http", started.elapsed().as_secs_f64() * 1000.0);
            match result {
                Ok(response) => {
                    debug!(
                        call_sid = self.core.call_sid,
                        url = %resolved.url,
                        attempt,
                        "{} delivered",
                        msg_type
                    );
                    return Ok(response);
                }
                Err(err) => {
                    if policy.should_retry(&err) && attempt < policy.max_attempts {
                        let delay = super::retry::backoff_delay(attempt);
                        info!(
                            call_sid = self.core.call_sid,
                            url = %resolved.url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "webhook attempt failed, retrying: {}",
                            err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.raise_alert(&err, &resolved);
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        resolved: &ResolvedHook,
        body: &str,
        b3: Option<&str>,
    ) -> Result<HookResponse, HookError> {
        let client = self.core.http_pool.client_for(&resolved.url)?;
        let mut request = match resolved.method {
            HookMethod::Get => {
                // GET hooks carry scalar fields as query parameters
                let mut request = client.get(resolved.url.clone());
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
                    let pairs: Vec<(String, String)> = map
                        .iter()
                        .filter_map(|(k, v)| match v {
                            Value::String(s) => Some((k.clone(), s.clone())),
                            Value::Number(n) => Some((k.clone(), n.to_string())),
                            Value::Bool(b) => Some((k.clone(), b.to_string())),
                            _ => None,
                        })
                        .collect();
                    request = request.query(&pairs);
                }
                request
            }
            HookMethod::Post => client
                .post(resolved.url.clone())
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.to_string()),
        };
        if let Some((username, password)) = &resolved.basic_auth {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(agent) = &self.core.config.http_user_agent {
            request = request.header(http::header::USER_AGENT, agent.as_str());
        }
        if let Some(b3) = b3 {
            request = request.header("b3", b3);
        }
        if resolved.method == HookMethod::Post {
            if let Some(signature) = self.core.signature(body) {
                request = request.header("JB-Signature", signature);
            }
        }

        let response = request.send().await.map_err(HookError::transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HookError::Status {
                code: status.as_u16(),
            });
        }
        let is_json = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(HookResponse::Empty);
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| HookError::Protocol(e.to_string()))?;
        if value.is_null() {
            Ok(HookResponse::Empty)
        } else {
            Ok(HookResponse::Json(value))
        }
    }

    /// The target wants a WebSocket: build the socket-based requestor with
    /// the same identity, hand it to the owner, and let it carry this
    /// message as its opening `session:new`.
    async fn handover_to_ws(
        self: &Arc<Self>,
        msg_type: MsgType,
        resolved: &ResolvedHook,
        params: Value,
    ) -> Result<HookResponse, HookError> {
        let mut core = self.core.clone();
        core.base_url = resolved.url.clone();
        info!(
            call_sid = core.call_sid,
            url = %resolved.url,
            "handover http -> ws"
        );
        let ws = WsRequestor::new(core);
        let _ = self
            .core
            .events
            .send(RequestorEvent::Handover(Requestor::Ws(ws.clone())));
        if msg_type == MsgType::SessionRedirect {
            self.close();
        }
        let hook = Hook::new(resolved.url.as_str());
        Box::pin(ws.request(MsgType::SessionNew, &hook, params, None)).await
    }

    fn raise_alert(&self, err: &HookError, resolved: &ResolvedHook) {
        match err {
            HookError::Status { code } => {
                crate::metrics::webhook::failure("http", "status");
                self.core.alerts.emit(
                    AlertKind::WebhookStatusFailure,
                    &self.core.account_sid,
                    Some(&self.core.call_sid),
                    &format!("{} returned {}", resolved.url, code),
                );
            }
            HookError::Transport(detail) => {
                crate::metrics::webhook::failure("http", "transport");
                self.core.alerts.emit(
                    AlertKind::WebhookConnectionFailure,
                    &self.core.account_sid,
                    Some(&self.core.call_sid),
                    &format!("{}: {}", resolved.url, detail),
                );
            }
            other => {
                crate::metrics::webhook::failure("http", "other");
                warn!(
                    call_sid = self.core.call_sid,
                    url = %resolved.url,
                    "webhook failed: {}",
                    other
                );
            }
        }
    }
}
