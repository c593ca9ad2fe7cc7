use crate::config::Config;
use crate::error::HookError;
use crate::hook::Hook;
use crate::media::{MediaEndpoint, TtsEngine};
use crate::requestor::{HookResponse, MsgType, Requestor};
use crate::session::{CallDialog, SessionNotice};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod config;
pub mod dial;
pub mod gather;
pub mod hangup;
pub mod pause;
pub mod play;
pub mod say;
pub mod sip_decline;
pub mod tag;
pub mod transcribe;

pub use config::ConfigTask;
pub use dial::DialTask;
pub use gather::GatherTask;
pub use hangup::HangupTask;
pub use pause::PauseTask;
pub use play::PlayTask;
pub use say::SayTask;
pub use sip_decline::SipDeclineTask;
pub use tag::TagTask;
pub use transcribe::TranscribeTask;

/// Closed set of verbs the interpreter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Say,
    Play,
    Gather,
    Pause,
    Hangup,
    Dial,
    Transcribe,
    Config,
    SipDecline,
    Tag,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Say => "say",
            TaskKind::Play => "play",
            TaskKind::Gather => "gather",
            TaskKind::Pause => "pause",
            TaskKind::Hangup => "hangup",
            TaskKind::Dial => "dial",
            TaskKind::Transcribe => "transcribe",
            TaskKind::Config => "config",
            TaskKind::SipDecline => "sip:decline",
            TaskKind::Tag => "tag",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "say" => Some(TaskKind::Say),
            "play" => Some(TaskKind::Play),
            "gather" => Some(TaskKind::Gather),
            "pause" => Some(TaskKind::Pause),
            "hangup" => Some(TaskKind::Hangup),
            "dial" => Some(TaskKind::Dial),
            "transcribe" => Some(TaskKind::Transcribe),
            "config" => Some(TaskKind::Config),
            "sip:decline" => Some(TaskKind::SipDecline),
            "tag" => Some(TaskKind::Tag),
            _ => None,
        }
    }

    /// Inbound commands this verb can absorb while running. Anything else
    /// aimed at the current verb falls back to the session.
    pub fn handled_commands(&self) -> &'static [&'static str] {
        match self {
            TaskKind::Play | TaskKind::Say => &["pause", "resume"],
            TaskKind::Dial | TaskKind::Transcribe => &["mute", "unmute"],
            _ => &[],
        }
    }

    pub fn handles_command(&self, command: &str) -> bool {
        self.handled_commands().contains(&command)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session must guarantee before `exec` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Any call state.
    None,
    /// Dialog established.
    StableCall,
    /// A media endpoint is allocated (created on demand).
    Endpoint,
    /// No final response sent yet; the task implies one.
    UnansweredCall,
}

/// A command routed from the session to the currently executing task.
#[derive(Debug, Clone)]
pub struct TaskCommand {
    pub name: String,
    pub data: Value,
}

/// Everything a task may touch while it runs. Built fresh per execution;
/// holds no owning reference back to the session.
pub struct TaskContext {
    pub call_sid: String,
    pub account_sid: String,
    pub requestor: Requestor,
    pub endpoint: Option<Arc<dyn MediaEndpoint>>,
    pub dialog: Arc<dyn CallDialog>,
    pub tts: Option<Arc<dyn TtsEngine>>,
    /// Cancelled when the task is killed; exec must resolve promptly after.
    pub killed: CancellationToken,
    pub commands: mpsc::UnboundedReceiver<TaskCommand>,
    pub notices: mpsc::UnboundedSender<SessionNotice>,
    pub base_params: Value,
    pub base_hook: Hook,
    pub epoch: u64,
    pub hook_in_flight: Arc<AtomicBool>,
    pub config: Arc<Config>,
    pub notify_events: bool,
    /// Session synthesizer defaults set by a prior `config` verb.
    pub synthesizer: Option<Value>,
    /// Session recognizer defaults set by a prior `config` verb.
    pub recognizer: Option<Value>,
}

impl TaskContext {
    pub fn endpoint(&self) -> Result<&Arc<dyn MediaEndpoint>> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| anyhow!("no media endpoint allocated"))
    }

    /// Session-default voice from the synthesizer settings, if any.
    pub fn default_voice(&self) -> Option<&str> {
        self.synthesizer
            .as_ref()
            .and_then(|s| s.get("voice"))
            .and_then(Value::as_str)
    }

    /// Session-default recognition language, if any.
    pub fn default_language(&self) -> Option<&str> {
        self.recognizer
            .as_ref()
            .and_then(|r| r.get("language"))
            .and_then(Value::as_str)
    }

    /// POST an event hook. A response that is an array of verb nodes asks
    /// the session to replace the remaining application.
    pub async fn perform_hook(
        &self,
        hook: &Hook,
        results: Value,
    ) -> Result<HookResponse, HookError> {
        let params = merge_params(&self.base_params, results);
        self.hook_in_flight.store(true, Ordering::SeqCst);
        let response = self
            .requestor
            .request(MsgType::VerbHook, hook, params, None)
            .await;
        self.hook_in_flight.store(false, Ordering::SeqCst);
        if let Ok(response) = &response {
            if let Some(verbs) = response.as_verbs() {
                if !verbs.is_empty() {
                    debug!(
                        call_sid = self.call_sid,
                        count = verbs.len(),
                        "hook returned new application"
                    );
                    let _ = self.notices.send(SessionNotice::Replace {
                        verbs: verbs.clone(),
                        epoch: self.epoch,
                    });
                }
            }
        }
        response
    }

    /// Report a completed verb through its action hook. Failures are
    /// recorded, never propagated: a dead action hook must not take the
    /// call down.
    pub async fn perform_action(&self, hook: &Option<Hook>, kind: TaskKind, results: Value) {
        let Some(hook) = hook else { return };
        if let Err(err) = self.perform_hook(hook, results).await {
            crate::metrics::webhook::failure("action-hook", "error");
            warn!(
                call_sid = self.call_sid,
                task = kind.as_str(),
                "action hook failed: {}",
                err
            );
        }
    }

    /// Fire-and-forget verb lifecycle notification, sent only when the
    /// application opted in via `config.notifyEvents`.
    pub fn notify_verb_status(&self, kind: TaskKind, status: &str) {
        if !self.notify_events {
            return;
        }
        if !matches!(self.requestor, Requestor::Ws(_)) {
            return;
        }
        let requestor = self.requestor.clone();
        let hook = self.base_hook.clone();
        let params = json!({
            "verb": kind.as_str(),
            "status": status,
            "callSid": self.call_sid,
        });
        crate::utils::spawn(async move {
            let _ = requestor
                .request(MsgType::VerbStatus, &hook, params, None)
                .await;
        });
    }

    /// Sleep until either the duration elapses or the task is killed.
    /// Returns true when killed.
    pub async fn killable_sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.killed.cancelled() => true,
        }
    }
}

fn merge_params(base: &Value, extra: Value) -> Value {
    let mut params = base.clone();
    if let (Value::Object(base_map), Value::Object(extra_map)) = (&mut params, extra) {
        for (k, v) in extra_map {
            base_map.insert(k, v);
        }
        return params;
    }
    params
}

/// One unit of application behavior. Created by the registry from a verb
/// node, executed exactly once by its session.
#[async_trait]
pub trait Task: Send {
    fn kind(&self) -> TaskKind;
    fn preconditions(&self) -> Precondition;

    /// Run to completion or until `ctx.killed` fires. The session awaits
    /// exactly this future before advancing.
    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()>;
}

/// Instantiate a task from a verb node. Nodes are single-key objects
/// (`{"say": {...}}`); a `{"verb": "say", ...}` spelling is accepted too.
pub fn make_task(node: &Value) -> Result<Box<dyn Task>> {
    let (name, data) = parse_verb_node(node)?;
    let kind = TaskKind::from_str(&name).ok_or_else(|| anyhow!("unknown verb '{}'", name))?;
    let task: Box<dyn Task> = match kind {
        TaskKind::Say => Box::new(SayTask::from_value(&data)?),
        TaskKind::Play => Box::new(PlayTask::from_value(&data)?),
        TaskKind::Gather => Box::new(GatherTask::from_value(&data)?),
        TaskKind::Pause => Box::new(PauseTask::from_value(&data)?),
        TaskKind::Hangup => Box::new(HangupTask::from_value(&data)?),
        TaskKind::Dial => Box::new(DialTask::from_value(&data)?),
        TaskKind::Transcribe => Box::new(TranscribeTask::from_value(&data)?),
        TaskKind::Config => Box::new(ConfigTask::from_value(&data)?),
        TaskKind::SipDecline => Box::new(SipDeclineTask::from_value(&data)?),
        TaskKind::Tag => Box::new(TagTask::from_value(&data)?),
    };
    Ok(task)
}

pub fn make_task_list(verbs: &[Value]) -> Result<Vec<Box<dyn Task>>> {
    verbs.iter().map(make_task).collect()
}

fn parse_verb_node(node: &Value) -> Result<(String, Value)> {
    let obj = node
        .as_object()
        .ok_or_else(|| anyhow!("verb node must be an object"))?;
    if let Some(Value::String(verb)) = obj.get("verb") {
        let mut data = obj.clone();
        data.remove("verb");
        return Ok((verb.clone(), Value::Object(data)));
    }
    if obj.len() == 1 {
        if let Some((name, data)) = obj.iter().next() {
            return Ok((name.clone(), data.clone()));
        }
    }
    Err(anyhow!(
        "verb node must be a single-key object or carry a 'verb' field"
    ))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_key_node() {
        let (name, data) = parse_verb_node(&json!({"say": {"text": "hi"}})).unwrap();
        assert_eq!(name, "say");
        assert_eq!(data["text"], "hi");
    }

    #[test]
    fn test_parse_verb_field_node() {
        let (name, data) = parse_verb_node(&json!({"verb": "pause", "length": 2})).unwrap();
        assert_eq!(name, "pause");
        assert_eq!(data["length"], 2);
    }

    #[test]
    fn test_make_task_rejects_unknown_verb() {
        assert!(make_task(&json!({"warble": {}})).is_err());
    }

    #[test]
    fn test_make_task_list_kinds() {
        let tasks = make_task_list(&[
            json!({"say": {"text": "hello"}}),
            json!({"pause": {"length": 1}}),
            json!({"hangup": {}}),
        ])
        .unwrap();
        let kinds: Vec<TaskKind> = tasks.iter().map(|t| t.kind()).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::Say, TaskKind::Pause, TaskKind::Hangup]
        );
    }

    #[test]
    fn test_handled_commands() {
        assert!(TaskKind::Play.handles_command("pause"));
        assert!(TaskKind::Transcribe.handles_command("mute"));
        assert!(!TaskKind::Gather.handles_command("mute"));
    }

    #[test]
    fn test_merge_params_overlays() {
        let base = json!({"callSid": "c1", "from": "alice"});
        let merged = merge_params(&base, json!({"digits": "123"}));
        assert_eq!(merged["callSid"], "c1");
        assert_eq!(merged["digits"], "123");
    }
}
