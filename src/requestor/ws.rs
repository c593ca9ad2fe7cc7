use super::retry::{self, RetryPolicy, INITIAL_BACKOFF_MS};
use super::{HookResponse, HttpRequestor, MsgType, Requestor, RequestorCore};
use crate::alert::AlertKind;
use crate::error::HookError;
use crate::event::{AppCommand, RequestorEvent};
use crate::hook::{Hook, ResolvedHook};
use crate::utils::{self, short_id, snakecase_keys};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const WS_SUBPROTOCOL: &str = "ws.jambonz.org";

/// Outbound sends refused once this many messages are parked waiting for a
/// (re)connect.
const QUEUED_MSG_HIGH_WATER: usize = 256;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckSender = oneshot::Sender<Result<Value, HookError>>;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub msgid: String,
    pub call_sid: String,
    pub hook: Option<String>,
    pub data: Value,
    pub b3: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "ack")]
    Ack {
        msgid: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "command")]
    Command {
        command: String,
        #[serde(default)]
        msgid: Option<String>,
        #[serde(default)]
        call_sid: Option<String>,
        #[serde(default, rename = "queueCommand")]
        queue_command: bool,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        data: Value,
    },
}

struct QueuedMsg {
    frame: OutboundFrame,
    wait: Option<AckSender>,
}

#[derive(Clone)]
struct CachedInit {
    hook_url: String,
    data: Value,
}

#[derive(Default)]
struct WsState {
    /// Writer into the live socket actor, None when no socket.
    sender: Option<mpsc::UnboundedSender<Message>>,
    /// Cancels the current socket actor without a graceful close frame.
    actor_cancel: Option<CancellationToken>,
    /// Successful opens so far; bounded by `max_reconnects`.
    connections: u32,
    connecting: bool,
    messages_in_flight: HashMap<String, AckSender>,
    queued: VecDeque<QueuedMsg>,
    backoff_ms: u64,
    reconnect_attempts: u32,
    closed_gracefully: bool,
    malicious: bool,
    /// msgid of a `session:new` whose ack has not arrived yet; re-keyed on
    /// reconnect so the eventual ack to either id resolves the original.
    init_msg_id: Option<String>,
    /// Cached `session:new` payload, replayed in `session:reconnect`.
    session_new: Option<CachedInit>,
    /// Queue flush gate: outbound traffic stays parked until this msgid is
    /// acked.
    reconnect_msgid: Option<String>,
}

impl WsState {
    fn write_frame(&self, frame: &OutboundFrame) -> Result<(), HookError> {
        let text = serde_json::to_string(frame).map_err(|e| HookError::Protocol(e.to_string()))?;
        match &self.sender {
            Some(tx) => tx
                .send(Message::Text(text.into()))
                .map_err(|_| HookError::NotConnected),
            None => Err(HookError::NotConnected),
        }
    }
}

/// Persistent full-duplex application-control channel with msgid/ack
/// correlation, queued sends across reconnects, and inbound command
/// dispatch to the owning session.
pub struct WsRequestor {
    pub core: RequestorCore,
    state: Mutex<WsState>,
}

impl WsRequestor {
    pub fn new(core: RequestorCore) -> Arc<Self> {
        Arc::new(Self {
            core,
            state: Mutex::new(WsState {
                backoff_ms: INITIAL_BACKOFF_MS,
                ..Default::default()
            }),
        })
    }

    pub fn account_sid(&self) -> &str {
        &self.core.account_sid
    }

    /// Number of successful socket opens, reconnects included.
    pub fn connection_count(&self) -> u32 {
        self.lock().connections
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().messages_in_flight.len()
    }

    pub fn is_malicious(&self) -> bool {
        self.lock().malicious
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Graceful shutdown: close 1000, discard every later `request`.
    pub async fn close(&self) {
        let mut st = self.lock();
        st.closed_gracefully = true;
        st.sender.take();
        st.actor_cancel.take();
    }

    pub async fn request(
        self: &Arc<Self>,
        msg_type: MsgType,
        hook: &Hook,
        params: Value,
        b3: Option<String>,
    ) -> Result<HookResponse, HookError> {
        let resolved = self.core.resolve(hook)?;
        if !resolved.scheme.is_ws() {
            return self
                .handover_to_http(msg_type, hook, &resolved, params, b3)
                .await;
        }

        let data = snakecase_keys(&params);
        let msgid = short_id();
        let frame = OutboundFrame {
            msg_type: msg_type.as_str().to_string(),
            msgid: msgid.clone(),
            call_sid: self.core.call_sid.clone(),
            hook: msg_type.includes_hook().then(|| resolved.url.to_string()),
            data: data.clone(),
            b3,
        };
        let wants_ack = msg_type.wants_ack();

        enum Route {
            /// Written to the live socket; response timer armed here.
            WaitArmed(oneshot::Receiver<Result<Value, HookError>>),
            /// Parked on the queue; the flush arms the response timer.
            WaitQueued(oneshot::Receiver<Result<Value, HookError>>),
            Sent,
            Discarded,
            Connect(OutboundFrame),
        }

        let route = {
            let mut st = self.lock();
            if st.malicious || st.closed_gracefully {
                Route::Discarded
            } else if st.connecting {
                if st.queued.len() >= QUEUED_MSG_HIGH_WATER {
                    if wants_ack {
                        return Err(HookError::QueueOverflow);
                    }
                    warn!(
                        call_sid = self.core.call_sid,
                        "queue over high water, dropping {}", msg_type
                    );
                    Route::Discarded
                } else if wants_ack {
                    let (tx, rx) = oneshot::channel();
                    st.queued.push_back(QueuedMsg {
                        frame,
                        wait: Some(tx),
                    });
                    Route::WaitQueued(rx)
                } else {
                    st.queued.push_back(QueuedMsg { frame, wait: None });
                    Route::Sent
                }
            } else if st.sender.is_some() {
                if wants_ack {
                    let (tx, rx) = oneshot::channel();
                    st.messages_in_flight.insert(msgid.clone(), tx);
                    if let Err(e) = st.write_frame(&frame) {
                        st.messages_in_flight.remove(&msgid);
                        return Err(e);
                    }
                    Route::WaitArmed(rx)
                } else {
                    st.write_frame(&frame)?;
                    Route::Sent
                }
            } else if st.connections == 0 {
                if msg_type != MsgType::SessionNew {
                    return Err(HookError::NotConnected);
                }
                st.connecting = true;
                st.session_new = Some(CachedInit {
                    hook_url: resolved.url.to_string(),
                    data: data.clone(),
                });
                Route::Connect(frame)
            } else {
                // reconnect budget exhausted; the channel is gone for good
                return Err(HookError::NotConnected);
            }
        };

        match route {
            Route::Discarded | Route::Sent => Ok(HookResponse::Empty),
            Route::WaitArmed(rx) => {
                self.spawn_watchdog(msgid);
                self.await_ack(rx).await
            }
            Route::WaitQueued(rx) => self.await_ack(rx).await,
            Route::Connect(frame) => self.initial_connect(resolved, frame, msgid).await,
        }
    }

    async fn await_ack(
        &self,
        rx: oneshot::Receiver<Result<Value, HookError>>,
    ) -> Result<HookResponse, HookError> {
        match rx.await {
            Ok(Ok(data)) => Ok(HookResponse::from_ack_data(data)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HookError::Transport("requestor torn down".into())),
        }
    }

    /// First connect, driven by the `session:new` request. Later requests
    /// issued while this is underway are parked on the queue and flushed
    /// once the socket opens.
    async fn initial_connect(
        self: &Arc<Self>,
        resolved: ResolvedHook,
        frame: OutboundFrame,
        msgid: String,
    ) -> Result<HookResponse, HookError> {
        let policy = RetryPolicy::from_override(&resolved.retry, 5);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            crate::metrics::webhook::attempt("ws");
            match self.open_socket(&resolved).await {
                Ok(()) => break,
                Err(err) => {
                    if policy.should_retry(&err) && attempt < policy.max_attempts {
                        let delay = retry::backoff_delay(attempt);
                        info!(
                            call_sid = self.core.call_sid,
                            url = %resolved.url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "websocket connect failed, retrying: {}",
                            err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    crate::metrics::webhook::failure("ws", "connect");
                    self.core.alerts.emit(
                        AlertKind::WebhookConnectionFailure,
                        &self.core.account_sid,
                        Some(&self.core.call_sid),
                        &format!("{}: {}", resolved.url, err),
                    );
                    let mut st = self.lock();
                    st.connecting = false;
                    reject_all(&mut st, "connect failed");
                    return Err(err);
                }
            }
        }

        let rx = {
            let mut st = self.lock();
            st.connecting = false;
            let (tx, rx) = oneshot::channel();
            st.messages_in_flight.insert(msgid.clone(), tx);
            st.init_msg_id = Some(msgid.clone());
            if let Err(e) = st.write_frame(&frame) {
                st.messages_in_flight.remove(&msgid);
                st.init_msg_id = None;
                return Err(e);
            }
            self.flush_queued(&mut st);
            rx
        };
        self.spawn_watchdog(msgid);
        self.await_ack(rx).await
    }

    /// Open a socket to the configured URL and hand it to a spawned actor.
    async fn open_socket(self: &Arc<Self>, resolved: &ResolvedHook) -> Result<(), HookError> {
        let mut request =
            tungstenite::client::IntoClientRequest::into_client_request(resolved.url.as_str())
                .map_err(|e| HookError::InvalidHook(e.to_string()))?;
        {
            let headers = request.headers_mut();
            headers.insert(
                "Sec-WebSocket-Protocol",
                WS_SUBPROTOCOL
                    .parse()
                    .map_err(|_| HookError::InvalidHook("subprotocol".into()))?,
            );
            if let Some((username, password)) = &resolved.basic_auth {
                let token = BASE64_STANDARD.encode(format!("{}:{}", username, password));
                if let Ok(value) = format!("Basic {}", token).parse() {
                    headers.insert(http::header::AUTHORIZATION, value);
                }
            }
        }

        let config = WebSocketConfig::default()
            .max_message_size(Some(self.core.config.ws_max_payload))
            .max_frame_size(Some(self.core.config.ws_max_payload));

        let connect = connect_async_with_config(request, Some(config), false);
        let (stream, _response) =
            match tokio::time::timeout(self.core.config.ws_handshake_timeout(), connect).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(tungstenite::Error::Http(response))) => {
                    return Err(HookError::Handshake {
                        status: Some(response.status().as_u16()),
                    })
                }
                Ok(Err(e)) => return Err(HookError::Transport(e.to_string())),
                Err(_) => return Err(HookError::Handshake { status: None }),
            };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let reconnect = {
            let mut st = self.lock();
            st.sender = Some(out_tx);
            st.actor_cancel = Some(cancel.clone());
            st.connections += 1;
            st.backoff_ms = INITIAL_BACKOFF_MS;
            st.reconnect_attempts = 0;
            st.connections > 1
        };
        crate::metrics::ws::connected(reconnect);
        info!(
            call_sid = self.core.call_sid,
            url = %resolved.url,
            reconnect,
            "websocket open"
        );

        let this = self.clone();
        utils::spawn(async move {
            this.socket_task(stream, out_rx, cancel).await;
        });
        Ok(())
    }

    /// Owns one socket incarnation: writes outbound frames, dispatches
    /// inbound traffic, sends pings, and reports the close.
    async fn socket_task(
        self: Arc<Self>,
        mut stream: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        crate::metrics::ws::set_active(ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1);
        let mut close_code: Option<u16> = None;
        let ping_interval = self.core.config.ws_ping_interval();
        let mut ping_timer = ping_interval.map(tokio::time::interval);
        if let Some(t) = ping_timer.as_mut() {
            t.tick().await; // first tick is immediate
        }

        loop {
            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(msg) => {
                        if stream.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // writer dropped: graceful close
                        let _ = stream
                            .send(Message::Close(Some(tungstenite::protocol::CloseFrame {
                                code: tungstenite::protocol::frame::coding::CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                        close_code = Some(1000);
                        break;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !self.on_text(text.as_str(), &mut stream).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        self.mark_malicious("binary frame from application", true);
                        let _ = stream.close(None).await;
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(tungstenite::Error::Capacity(e))) => {
                        warn!(
                            call_sid = self.core.call_sid,
                            "oversize inbound frame: {}", e
                        );
                        self.mark_malicious("payload over limit", false);
                        let _ = stream.close(None).await;
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(call_sid = self.core.call_sid, "websocket error: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = async {
                    match ping_timer.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let _ = stream.send(Message::Ping(Vec::new().into())).await;
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
        crate::metrics::ws::set_active(
            ACTIVE_CONNECTIONS
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1),
        );
        self.on_socket_closed(close_code).await;
    }

    /// Returns false when the socket must be torn down.
    async fn on_text(self: &Arc<Self>, text: &str, stream: &mut WsStream) -> bool {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                // tell the application what it sent, then cut it off
                let notice = OutboundFrame {
                    msg_type: MsgType::JambonzError.as_str().to_string(),
                    msgid: short_id(),
                    call_sid: self.core.call_sid.clone(),
                    hook: None,
                    data: json!({"error": format!("invalid payload: {}", e)}),
                    b3: None,
                };
                if let Ok(body) = serde_json::to_string(&notice) {
                    let _ = stream.send(Message::Text(body.into())).await;
                }
                self.mark_malicious(&format!("unparseable frame: {}", e), true);
                let _ = stream.close(None).await;
                return false;
            }
        };

        match frame {
            InboundFrame::Ack { msgid, data } => {
                let mut st = self.lock();
                if let Some(tx) = st.messages_in_flight.remove(&msgid) {
                    let _ = tx.send(Ok(data));
                } else {
                    debug!(
                        call_sid = self.core.call_sid,
                        msgid, "ack for unknown or expired msgid"
                    );
                }
                if st.init_msg_id.as_deref() == Some(msgid.as_str()) {
                    st.init_msg_id = None;
                }
                if st.reconnect_msgid.as_deref() == Some(msgid.as_str()) {
                    st.reconnect_msgid = None;
                    st.connecting = false;
                    self.flush_queued(&mut st);
                }
            }
            InboundFrame::Command {
                command,
                msgid,
                call_sid,
                queue_command,
                tool_call_id,
                data,
            } => {
                let _ = self.core.events.send(RequestorEvent::Command(AppCommand {
                    command,
                    msgid,
                    call_sid,
                    queue_command,
                    tool_call_id,
                    data,
                }));
            }
        }
        true
    }

    fn mark_malicious(&self, reason: &str, alert: bool) {
        warn!(
            call_sid = self.core.call_sid,
            "malicious client: {}", reason
        );
        crate::metrics::ws::malicious_close();
        if alert {
            self.core.alerts.emit(
                AlertKind::InvalidAppPayload,
                &self.core.account_sid,
                Some(&self.core.call_sid),
                reason,
            );
        }
        let mut st = self.lock();
        st.malicious = true;
        st.sender.take();
        st.actor_cancel.take();
        reject_all(&mut st, reason);
    }

    async fn on_socket_closed(self: &Arc<Self>, close_code: Option<u16>) {
        let (should_reconnect, delay_ms, reason) = {
            let mut st = self.lock();
            st.sender.take();
            st.actor_cancel.take();

            if st.malicious {
                (false, 0, "malicious client".to_string())
            } else if st.closed_gracefully || close_code == Some(1000) {
                st.closed_gracefully = true;
                (false, 0, "graceful close".to_string())
            } else if st.connections >= self.core.config.max_reconnects {
                reject_all(&mut st, "max reconnects exceeded");
                (false, 0, "max reconnects exceeded".to_string())
            } else {
                st.connecting = true;
                let delay = st.backoff_ms;
                st.backoff_ms = retry::next_backoff_ms(delay);
                (true, delay, format!("close code {:?}", close_code))
            }
        };

        if should_reconnect {
            info!(
                call_sid = self.core.call_sid,
                delay_ms, "websocket dropped ({}), reconnecting", reason
            );
            let this = self.clone();
            utils::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                this.reconnect().await;
            });
        } else if !matches!(reason.as_str(), "graceful close") {
            let _ = self
                .core
                .events
                .send(RequestorEvent::ConnectionDropped { reason });
        }
    }

    fn reconnect(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let hook = Hook::new(self.core.base_url.as_str());
            let resolved = match self.core.resolve(&hook) {
                Ok(r) => r,
                Err(e) => {
                    warn!(call_sid = self.core.call_sid, "reconnect aborted: {}", e);
                    return;
                }
            };
            match self.open_socket(&resolved).await {
                Ok(()) => self.send_session_reconnect(),
                Err(err) => {
                    let (retry_again, delay_ms) = {
                        let mut st = self.lock();
                        st.reconnect_attempts += 1;
                        if st.closed_gracefully || st.reconnect_attempts >= 5 {
                            reject_all(&mut st, "reconnect failed");
                            st.connecting = false;
                            (false, 0)
                        } else {
                            let delay = st.backoff_ms;
                            st.backoff_ms = retry::next_backoff_ms(delay);
                            (true, delay)
                        }
                    };
                    if retry_again {
                        info!(
                            call_sid = self.core.call_sid,
                            delay_ms, "reconnect attempt failed, retrying: {}", err
                        );
                        let this = self.clone();
                        utils::spawn(async move {
                            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                            this.reconnect().await;
                        });
                    } else {
                        warn!(
                            call_sid = self.core.call_sid,
                            "websocket gone for good: {}", err
                        );
                        let _ = self.core.events.send(RequestorEvent::ConnectionDropped {
                            reason: err.to_string(),
                        });
                    }
                }
            }
        })
    }

    /// After a successful reopen: replay the cached `session:new` payload
    /// as `session:reconnect` and gate the queue on its ack. If the
    /// original `session:new` is still unacked its in-flight entry is
    /// re-keyed to the new msgid, so the client may ack either id.
    fn send_session_reconnect(self: &Arc<Self>) {
        let msgid = short_id();
        let (frame, ok) = {
            let mut st = self.lock();
            let cached = match &st.session_new {
                Some(c) => c.clone(),
                None => CachedInit {
                    hook_url: self.core.base_url.to_string(),
                    data: Value::Null,
                },
            };
            let frame = OutboundFrame {
                msg_type: MsgType::SessionReconnect.as_str().to_string(),
                msgid: msgid.clone(),
                call_sid: self.core.call_sid.clone(),
                hook: Some(cached.hook_url.clone()),
                data: cached.data,
                b3: None,
            };
            if let Some(old) = st.init_msg_id.take() {
                if let Some(tx) = st.messages_in_flight.remove(&old) {
                    st.messages_in_flight.insert(msgid.clone(), tx);
                }
                st.init_msg_id = Some(msgid.clone());
            } else {
                let (tx, _rx) = oneshot::channel();
                st.messages_in_flight.insert(msgid.clone(), tx);
            }
            st.reconnect_msgid = Some(msgid.clone());
            let ok = st.write_frame(&frame).is_ok();
            if !ok {
                st.messages_in_flight.remove(&msgid);
                st.reconnect_msgid = None;
            }
            (frame, ok)
        };
        if ok {
            debug!(
                call_sid = self.core.call_sid,
                msgid = frame.msgid,
                "sent session:reconnect"
            );
            self.spawn_watchdog(msgid);
        }
    }

    /// Arm the per-msgid response timer: on expiry the in-flight entry is
    /// removed and its caller rejected. An expired reconnect handshake also
    /// drops the socket so the close path can try again.
    fn spawn_watchdog(self: &Arc<Self>, msgid: String) {
        let this = self.clone();
        utils::spawn(async move {
            tokio::time::sleep(this.core.config.response_timeout()).await;
            let mut st = this.lock();
            if let Some(tx) = st.messages_in_flight.remove(&msgid) {
                let _ = tx.send(Err(HookError::ResponseTimeout));
                crate::metrics::webhook::failure("ws", "response-timeout");
                if st.init_msg_id.as_deref() == Some(msgid.as_str()) {
                    st.init_msg_id = None;
                }
                if st.reconnect_msgid.as_deref() == Some(msgid.as_str()) {
                    st.reconnect_msgid = None;
                    if let Some(cancel) = st.actor_cancel.take() {
                        cancel.cancel();
                    }
                }
            }
        });
    }

    /// Flush parked messages in submission order. Callers hold the state
    /// lock.
    fn flush_queued(self: &Arc<Self>, st: &mut WsState) {
        let queued = std::mem::take(&mut st.queued);
        for item in queued {
            let msgid = item.frame.msgid.clone();
            match item.wait {
                Some(tx) => {
                    st.messages_in_flight.insert(msgid.clone(), tx);
                    match st.write_frame(&item.frame) {
                        Ok(()) => self.spawn_watchdog(msgid),
                        Err(e) => {
                            if let Some(tx) = st.messages_in_flight.remove(&msgid) {
                                let _ = tx.send(Err(e));
                            }
                        }
                    }
                }
                None => {
                    let _ = st.write_frame(&item.frame);
                }
            }
        }
    }

    async fn handover_to_http(
        self: &Arc<Self>,
        msg_type: MsgType,
        hook: &Hook,
        resolved: &ResolvedHook,
        params: Value,
        b3: Option<String>,
    ) -> Result<HookResponse, HookError> {
        let mut core = self.core.clone();
        core.base_url = resolved.url.clone();
        info!(
            call_sid = core.call_sid,
            url = %resolved.url,
            "handover ws -> http"
        );
        let http = HttpRequestor::new(core);
        let _ = self
            .core
            .events
            .send(RequestorEvent::Handover(Requestor::Http(http.clone())));
        if msg_type == MsgType::SessionRedirect {
            self.close().await;
        }
        let target = Hook {
            url: resolved.url.to_string(),
            method: hook.method,
            username: hook.username.clone(),
            password: hook.password.clone(),
        };
        http.request(msg_type, &target, params, b3).await
    }
}

fn reject_all(st: &mut WsState, reason: &str) {
    for (_, tx) in st.messages_in_flight.drain() {
        let _ = tx.send(Err(HookError::Transport(reason.to_string())));
    }
    for item in st.queued.drain(..) {
        if let Some(tx) = item.wait {
            let _ = tx.send(Err(HookError::Transport(reason.to_string())));
        }
    }
}

#[cfg(test)]
mod frame_tests {
    use super::*;

    #[test]
    fn test_outbound_frame_omits_empty_fields() {
        let frame = OutboundFrame {
            msg_type: "call:status".into(),
            msgid: "abc".into(),
            call_sid: "sid".into(),
            hook: None,
            data: json!({"call_status": "completed"}),
            b3: None,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(!text.contains("\"hook\""));
        assert!(!text.contains("\"b3\""));
        assert!(text.contains("\"type\":\"call:status\""));
    }

    #[test]
    fn test_inbound_ack_parse() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"ack","msgid":"m1","data":[{"say":{"text":"hi"}}]}"#)
                .unwrap();
        match frame {
            InboundFrame::Ack { msgid, data } => {
                assert_eq!(msgid, "m1");
                assert!(data.is_array());
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn test_inbound_command_parse_defaults() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"command","command":"redirect","data":[]}"#).unwrap();
        match frame {
            InboundFrame::Command {
                command,
                queue_command,
                ..
            } => {
                assert_eq!(command, "redirect");
                assert!(!queue_command);
            }
            _ => panic!("expected command"),
        }
    }
}
