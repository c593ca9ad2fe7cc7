use crate::app::AppContext;
use crate::error::SessionError;
use crate::event::{RequestorEvent, RequestorEventReceiver};
use crate::hook::{Hook, HookScheme};
use crate::media::{MediaEndpoint, MediaServer, TtsEngine};
use crate::requestor::{HttpRequestor, MsgType, Requestor, RequestorCore, WsRequestor};
use crate::tasks::{make_task_list, Precondition, Task, TaskCommand, TaskContext, TaskKind};
use crate::utils;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

mod command;

#[cfg(test)]
mod tests;

/// The accepted SIP dialog, delivered by the signalling layer. The session
/// only needs answer/decline/hangup and the established flag.
#[async_trait]
pub trait CallDialog: Send + Sync {
    fn established(&self) -> bool;
    async fn answer(&self) -> Result<()>;
    async fn decline(
        &self,
        status: u16,
        reason: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<()>;
    async fn hangup(&self, headers: &HashMap<String, String>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub caller_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Replacing,
    Ending,
    Ended,
}

/// Session-level defaults a `config` verb can change mid-call.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub notify_events: Option<bool>,
    pub synthesizer: Option<Value>,
    pub recognizer: Option<Value>,
}

/// Messages tasks send back to their session.
#[derive(Debug)]
pub enum SessionNotice {
    /// A hook returned a new application; `epoch` is the application epoch
    /// the producing task ran under. Stale epochs are discarded.
    Replace {
        verbs: Vec<Value>,
        epoch: u64,
    },
    Terminate {
        reason: String,
    },
    TrackTmpFile(PathBuf),
    ApplySettings(SessionSettings),
    MergeCustomerData(Value),
}

/// Outcome record handed back when the session finishes.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub call_sid: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
    pub answered: bool,
    pub application_epoch: u64,
}

struct RunningTask {
    kind: TaskKind,
    kill: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<TaskCommand>,
    hook_in_flight: Arc<AtomicBool>,
}

/// Per-call driver: owns the endpoint and the requestor, executes the task
/// list strictly serially, applies redirects and inbound commands, and
/// guarantees teardown.
pub struct CallSession {
    call_sid: String,
    account_sid: String,
    caller_info: CallerInfo,
    app: AppContext,
    dialog: Arc<dyn CallDialog>,
    media: Arc<dyn MediaServer>,
    tts: Option<Arc<dyn TtsEngine>>,
    requestor: Requestor,
    application: Vec<Value>,
    app_hook: Option<Hook>,
    call_status_hook: Option<Hook>,
    tasks: VecDeque<Box<dyn Task>>,
    current: Option<RunningTask>,
    pending_replacement: Option<Vec<Value>>,
    queued_commands: VecDeque<crate::event::AppCommand>,
    application_epoch: u64,
    state: SessionState,
    notify_events: bool,
    synthesizer: Option<Value>,
    recognizer: Option<Value>,
    customer_data: Value,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    tmp_files: Vec<PathBuf>,
    answered: bool,
    muted: bool,
    ended_reason: String,
    cancel: CancellationToken,
    requestor_rx: Option<RequestorEventReceiver>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<SessionNotice>>,
    started_at: DateTime<Utc>,
}

pub struct CallSessionBuilder {
    app: AppContext,
    call_sid: Option<String>,
    account_sid: String,
    secret: Option<String>,
    caller_info: Option<CallerInfo>,
    dialog: Option<Arc<dyn CallDialog>>,
    media: Option<Arc<dyn MediaServer>>,
    tts: Option<Arc<dyn TtsEngine>>,
    base_url: Option<String>,
    application: Vec<Value>,
    app_hook: Option<Hook>,
    call_status_hook: Option<Hook>,
}

impl CallSessionBuilder {
    pub fn new(app: AppContext) -> Self {
        Self {
            app,
            call_sid: None,
            account_sid: String::new(),
            secret: None,
            caller_info: None,
            dialog: None,
            media: None,
            tts: None,
            base_url: None,
            application: Vec::new(),
            app_hook: None,
            call_status_hook: None,
        }
    }

    pub fn call_sid(mut self, call_sid: impl Into<String>) -> Self {
        self.call_sid = Some(call_sid.into());
        self
    }

    pub fn account_sid(mut self, account_sid: impl Into<String>) -> Self {
        self.account_sid = account_sid.into();
        self
    }

    pub fn signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn caller_info(mut self, info: CallerInfo) -> Self {
        self.caller_info = Some(info);
        self
    }

    pub fn dialog(mut self, dialog: Arc<dyn CallDialog>) -> Self {
        self.dialog = Some(dialog);
        self
    }

    pub fn media(mut self, media: Arc<dyn MediaServer>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn tts(mut self, tts: Arc<dyn TtsEngine>) -> Self {
        self.tts = Some(tts);
        self
    }

    /// Base URL hooks resolve against; its scheme picks the initial
    /// transport.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// The initial application (verb nodes). When empty and an app hook is
    /// set, the session fetches the application with `session:new`.
    pub fn application(mut self, verbs: Vec<Value>) -> Self {
        self.application = verbs;
        self
    }

    pub fn app_hook(mut self, hook: Hook) -> Self {
        self.app_hook = Some(hook);
        self
    }

    pub fn call_status_hook(mut self, hook: Hook) -> Self {
        self.call_status_hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<CallSession> {
        let call_sid = self
            .call_sid
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let caller_info = self
            .caller_info
            .ok_or_else(|| anyhow!("caller_info required"))?;
        let dialog = self.dialog.ok_or_else(|| anyhow!("dialog required"))?;
        let media = self.media.ok_or_else(|| anyhow!("media server required"))?;
        let base_url = Url::parse(
            self.base_url
                .as_deref()
                .ok_or_else(|| anyhow!("base_url required"))?,
        )?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let core = RequestorCore {
            account_sid: self.account_sid.clone(),
            call_sid: call_sid.clone(),
            secret: self.secret,
            base_url: base_url.clone(),
            config: self.app.config.clone(),
            alerts: self.app.alerts.clone(),
            events: event_tx,
            http_pool: self.app.http_pool.clone(),
        };
        let scheme = Hook::new(base_url.as_str()).resolve(&base_url)?.scheme;
        let requestor = if scheme.is_ws() {
            Requestor::Ws(WsRequestor::new(core))
        } else {
            debug_assert!(matches!(scheme, HookScheme::Http | HookScheme::Https));
            Requestor::Http(HttpRequestor::new(core))
        };

        Ok(CallSession {
            call_sid,
            account_sid: self.account_sid,
            caller_info,
            app: self.app,
            dialog,
            media,
            tts: self.tts,
            requestor,
            application: self.application,
            app_hook: self.app_hook,
            call_status_hook: self.call_status_hook,
            tasks: VecDeque::new(),
            current: None,
            pending_replacement: None,
            queued_commands: VecDeque::new(),
            application_epoch: 0,
            state: SessionState::Idle,
            notify_events: false,
            synthesizer: None,
            recognizer: None,
            customer_data: Value::Null,
            endpoint: None,
            tmp_files: Vec::new(),
            answered: false,
            muted: false,
            ended_reason: "completed".to_string(),
            cancel: CancellationToken::new(),
            requestor_rx: Some(event_rx),
            notice_tx,
            notice_rx: Some(notice_rx),
            started_at: Utc::now(),
        })
    }
}

impl CallSession {
    pub fn builder(app: AppContext) -> CallSessionBuilder {
        CallSessionBuilder::new(app)
    }

    pub fn call_sid(&self) -> &str {
        &self.call_sid
    }

    /// Cancelling this token terminates the session (signalling hangup).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the call to completion. Runs the task list strictly serially;
    /// while a task is suspended, inbound commands and hook redirects are
    /// absorbed and applied at the next cooperative boundary.
    pub async fn exec(mut self) -> Result<SessionRecord> {
        crate::metrics::session::started();
        let started = Instant::now();
        let mut requestor_rx = self
            .requestor_rx
            .take()
            .ok_or_else(|| anyhow!("session already executed"))?;
        let mut notice_rx = self
            .notice_rx
            .take()
            .ok_or_else(|| anyhow!("session already executed"))?;
        self.state = SessionState::Running;
        info!(
            call_sid = self.call_sid,
            from = self.caller_info.from,
            to = self.caller_info.to,
            direction = self.caller_info.direction.as_str(),
            "new call session"
        );

        if self.fetch_application().await {
            match make_task_list(&std::mem::take(&mut self.application)) {
                Ok(tasks) => self.tasks = tasks.into(),
                Err(err) => {
                    warn!(call_sid = self.call_sid, "invalid application: {}", err);
                    self.reply_error(format!("invalid application: {}", err));
                    self.ended_reason = "invalid application".to_string();
                }
            }
        }

        'session: loop {
            // cooperative boundary: queued commands first, then any pending
            // replacement, then the next task
            while let Some(cmd) = self.queued_commands.pop_front() {
                self.dispatch_command(cmd).await;
            }
            if matches!(self.state, SessionState::Ending) {
                break 'session;
            }
            if let Some(verbs) = self.pending_replacement.take() {
                match make_task_list(&verbs) {
                    Ok(tasks) => {
                        self.tasks = tasks.into();
                        self.state = SessionState::Running;
                    }
                    Err(err) => {
                        warn!(
                            call_sid = self.call_sid,
                            "bad replacement application: {}", err
                        );
                        self.reply_error(format!("invalid application: {}", err));
                        self.state = SessionState::Running;
                    }
                }
            }
            let Some(mut task) = self.tasks.pop_front() else {
                break 'session;
            };
            let kind = task.kind();

            if let Err(err) = self.ensure_preconditions(task.as_ref()).await {
                warn!(
                    call_sid = self.call_sid,
                    task = kind.as_str(),
                    "skipping task: {}",
                    err
                );
                continue;
            }

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let kill = CancellationToken::new();
            let hook_in_flight = Arc::new(AtomicBool::new(false));
            self.current = Some(RunningTask {
                kind,
                kill: kill.clone(),
                cmd_tx,
                hook_in_flight: hook_in_flight.clone(),
            });
            let mut ctx = TaskContext {
                call_sid: self.call_sid.clone(),
                account_sid: self.account_sid.clone(),
                requestor: self.requestor.clone(),
                endpoint: self.endpoint.clone(),
                dialog: self.dialog.clone(),
                tts: self.tts.clone(),
                killed: kill.clone(),
                commands: cmd_rx,
                notices: self.notice_tx.clone(),
                base_params: self.base_params(),
                base_hook: Hook::new(self.requestor.base_url().as_str()),
                epoch: self.application_epoch,
                hook_in_flight,
                config: self.app.config.clone(),
                notify_events: self.notify_events,
                synthesizer: self.synthesizer.clone(),
                recognizer: self.recognizer.clone(),
            };

            debug!(call_sid = self.call_sid, task = kind.as_str(), "task begin");
            let task_started = Instant::now();
            let cancel = self.cancel.clone();
            let mut cancel_handled = false;
            {
                let fut = task.exec(&mut ctx);
                tokio::pin!(fut);
                loop {
                    tokio::select! {
                        result = &mut fut => {
                            if let Err(err) = result {
                                warn!(
                                    call_sid = self.call_sid,
                                    task = kind.as_str(),
                                    "task ended in error: {}",
                                    err
                                );
                                self.ended_reason = "task error".to_string();
                                self.state = SessionState::Ending;
                            }
                            break;
                        }
                        Some(event) = requestor_rx.recv() => {
                            self.on_requestor_event(event).await;
                        }
                        Some(notice) = notice_rx.recv() => {
                            self.on_notice(notice);
                        }
                        _ = cancel.cancelled(), if !cancel_handled => {
                            cancel_handled = true;
                            self.state = SessionState::Ending;
                            self.ended_reason = "terminated".to_string();
                            kill.cancel();
                        }
                    }
                }
            }
            // a hook response or command may have landed in the same poll
            // the task finished in; drain before advancing
            while let Ok(notice) = notice_rx.try_recv() {
                self.on_notice(notice);
            }
            while let Ok(event) = requestor_rx.try_recv() {
                self.on_requestor_event(event).await;
            }
            crate::metrics::session::task_duration(
                kind.as_str(),
                task_started.elapsed().as_secs_f64() * 1000.0,
            );
            self.current = None;
            debug!(call_sid = self.call_sid, task = kind.as_str(), "task end");

            if matches!(self.state, SessionState::Ending) {
                break 'session;
            }
        }

        // drain anything that arrived while the last task was finishing
        while let Ok(notice) = notice_rx.try_recv() {
            if let SessionNotice::TrackTmpFile(path) = notice {
                self.tmp_files.push(path);
            }
        }
        self.teardown().await;
        crate::metrics::session::duration(started.elapsed().as_secs_f64());

        Ok(SessionRecord {
            call_sid: self.call_sid.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            reason: self.ended_reason.clone(),
            answered: self.answered,
            application_epoch: self.application_epoch,
        })
    }

    /// When constructed without an application, fetch it with
    /// `session:new`. Returns false when the session cannot proceed.
    async fn fetch_application(&mut self) -> bool {
        if !self.application.is_empty() {
            return true;
        }
        let Some(hook) = self.app_hook.clone() else {
            self.ended_reason = "no application".to_string();
            return false;
        };
        match self
            .requestor
            .request(MsgType::SessionNew, &hook, self.base_params(), None)
            .await
        {
            Ok(response) => match response.as_verbs() {
                Some(verbs) if !verbs.is_empty() => {
                    self.application = verbs.clone();
                    true
                }
                _ => {
                    warn!(call_sid = self.call_sid, "application returned no verbs");
                    self.ended_reason = "no application".to_string();
                    false
                }
            },
            Err(err) => {
                warn!(call_sid = self.call_sid, "session:new failed: {}", err);
                self.ended_reason = "webhook failure".to_string();
                false
            }
        }
    }

    async fn on_requestor_event(&mut self, event: RequestorEvent) {
        match event {
            RequestorEvent::Command(cmd) => {
                let immediate = matches!(cmd.command.as_str(), "hangup" | "mute" | "unmute");
                if immediate {
                    self.dispatch_command(cmd).await;
                } else if cmd.queue_command {
                    // applied at the next cooperative boundary
                    self.queued_commands.push_back(cmd);
                } else {
                    self.dispatch_command(cmd).await;
                }
            }
            RequestorEvent::Handover(new_requestor) => {
                info!(call_sid = self.call_sid, "requestor handover");
                if let Some(current) = &self.current {
                    if current
                        .hook_in_flight
                        .load(std::sync::atomic::Ordering::SeqCst)
                    {
                        current.kill.cancel();
                    }
                }
                self.requestor = new_requestor;
            }
            RequestorEvent::ConnectionDropped { reason } => {
                warn!(
                    call_sid = self.call_sid,
                    "application channel dropped: {}", reason
                );
            }
        }
    }

    fn on_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Replace { verbs, epoch } => {
                if epoch < self.application_epoch {
                    debug!(
                        call_sid = self.call_sid,
                        epoch,
                        current = self.application_epoch,
                        "discarding stale redirect"
                    );
                    return;
                }
                self.replace_application(verbs);
            }
            SessionNotice::Terminate { reason } => {
                self.ended_reason = reason;
                self.state = SessionState::Ending;
                if let Some(current) = &self.current {
                    current.kill.cancel();
                }
            }
            SessionNotice::TrackTmpFile(path) => self.tmp_files.push(path),
            SessionNotice::ApplySettings(settings) => {
                if let Some(notify) = settings.notify_events {
                    self.notify_events = notify;
                }
                if settings.synthesizer.is_some() {
                    self.synthesizer = settings.synthesizer;
                }
                if settings.recognizer.is_some() {
                    self.recognizer = settings.recognizer;
                }
            }
            SessionNotice::MergeCustomerData(data) => {
                if let (Value::Object(current), Value::Object(new)) =
                    (&mut self.customer_data, &data)
                {
                    for (k, v) in new {
                        current.insert(k.clone(), v.clone());
                    }
                } else {
                    self.customer_data = data;
                }
            }
        }
    }

    /// Supplant the remainder of the application. Kills the current task,
    /// clears the task list, and bumps the epoch so responses from the old
    /// application are ignored on arrival.
    pub(crate) fn replace_application(&mut self, verbs: Vec<Value>) {
        info!(
            call_sid = self.call_sid,
            verbs = verbs.len(),
            epoch = self.application_epoch + 1,
            "replacing application"
        );
        if let Some(current) = &self.current {
            current.kill.cancel();
        }
        self.tasks.clear();
        self.pending_replacement = Some(verbs);
        self.application_epoch += 1;
        self.state = SessionState::Replacing;
        crate::metrics::session::application_replaced();
    }

    async fn ensure_preconditions(&mut self, task: &dyn Task) -> Result<(), SessionError> {
        let kind = task.kind();
        match task.preconditions() {
            Precondition::None => Ok(()),
            Precondition::StableCall | Precondition::Endpoint => {
                if !self.dialog.established() {
                    self.dialog
                        .answer()
                        .await
                        .map_err(|e| SessionError::Precondition {
                            task: kind.as_str(),
                            precondition: "stable-call",
                            reason: e.to_string(),
                        })?;
                    self.answered = true;
                    self.send_call_status("in-progress");
                }
                if task.preconditions() == Precondition::Endpoint && self.endpoint.is_none() {
                    let endpoint = self.media.allocate(&self.call_sid).await.map_err(|e| {
                        SessionError::Precondition {
                            task: kind.as_str(),
                            precondition: "endpoint",
                            reason: e.to_string(),
                        }
                    })?;
                    self.endpoint = Some(endpoint);
                }
                Ok(())
            }
            Precondition::UnansweredCall => {
                if self.dialog.established() {
                    Err(SessionError::Precondition {
                        task: kind.as_str(),
                        precondition: "unanswered-call",
                        reason: "call already answered".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn base_params(&self) -> Value {
        let mut params = json!({
            "callSid": self.call_sid,
            "accountSid": self.account_sid,
            "callId": self.caller_info.call_id,
            "from": self.caller_info.from,
            "to": self.caller_info.to,
            "direction": self.caller_info.direction.as_str(),
            "callStatus": if self.answered { "in-progress" } else { "ringing" },
        });
        if self.customer_data.is_object() {
            params["customerData"] = self.customer_data.clone();
        }
        params
    }

    /// Fire-and-forget call lifecycle notification.
    fn send_call_status(&self, status: &str) {
        let hook = match (&self.call_status_hook, &self.requestor) {
            (Some(hook), _) => hook.clone(),
            (None, Requestor::Ws(_)) => Hook::new(self.requestor.base_url().as_str()),
            (None, Requestor::Http(_)) => return,
        };
        let mut params = self.base_params();
        params["callStatus"] = Value::String(status.to_string());
        let requestor = self.requestor.clone();
        utils::spawn(async move {
            let _ = requestor
                .request(MsgType::CallStatus, &hook, params, None)
                .await;
        });
    }

    /// Resource ladder: every step runs even if an earlier one fails, and
    /// no failure escapes past session end.
    async fn teardown(&mut self) {
        info!(
            call_sid = self.call_sid,
            reason = self.ended_reason,
            "session teardown"
        );
        if let Some(current) = self.current.take() {
            current.kill.cancel();
        }
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(err) = endpoint.destroy().await {
                warn!(call_sid = self.call_sid, "endpoint release failed: {}", err);
            }
        }
        if self.answered {
            if let Err(err) = self.dialog.hangup(&HashMap::new()).await {
                debug!(call_sid = self.call_sid, "dialog hangup: {}", err);
            }
        }
        for path in self.tmp_files.drain(..) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(
                    call_sid = self.call_sid,
                    file = %path.display(),
                    "tmp file cleanup: {}",
                    err
                );
            }
        }
        let hook = match (&self.call_status_hook, &self.requestor) {
            (Some(hook), _) => Some(hook.clone()),
            (None, Requestor::Ws(_)) => Some(Hook::new(self.requestor.base_url().as_str())),
            (None, Requestor::Http(_)) => None,
        };
        if let Some(hook) = hook {
            let mut params = self.base_params();
            params["callStatus"] = Value::String("completed".to_string());
            params["reason"] = Value::String(self.ended_reason.clone());
            let _ = self
                .requestor
                .request(MsgType::CallStatus, &hook, params, None)
                .await;
        }
        self.requestor.close().await;
        crate::metrics::session::ended(&self.ended_reason);
        self.state = SessionState::Ended;
    }
}
