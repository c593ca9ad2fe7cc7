use super::{Precondition, Task, TaskContext, TaskKind};
use crate::hook::{Hook, HookSpec};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Continuous speech recognition on the caller leg. Each final transcript
/// is posted to the transcription hook; the hook may redirect the call.
/// Runs until killed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeParams {
    pub transcription_hook: HookSpec,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub interim: bool,
}

pub struct TranscribeTask {
    params: TranscribeParams,
    hook: Hook,
}

impl TranscribeTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        let params: TranscribeParams = serde_json::from_value(data.clone())?;
        let hook = Hook::from(params.transcription_hook.clone());
        Ok(Self { params, hook })
    }
}

#[async_trait]
impl Task for TranscribeTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Transcribe
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let endpoint = ctx.endpoint()?.clone();
        let language = self
            .params
            .language
            .as_deref()
            .or_else(|| ctx.default_language())
            .unwrap_or("en-US")
            .to_string();
        endpoint
            .api("start_transcription", &[endpoint.uuid(), &language])
            .await?;
        ctx.notify_verb_status(TaskKind::Transcribe, "begin");
        info!(call_sid = ctx.call_sid, language, "transcribe: started");

        let mut transcript_rx = endpoint.subscribe_event("transcript");
        loop {
            tokio::select! {
                Some(transcript) = transcript_rx.recv() => {
                    let is_final = transcript
                        .get("is_final")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if !is_final && !self.params.interim {
                        continue;
                    }
                    let results = json!({"speech": transcript, "isFinal": is_final});
                    if let Err(err) = ctx.perform_hook(&self.hook, results).await {
                        // a dead hook does not stop recognition
                        warn!(
                            call_sid = ctx.call_sid,
                            "transcription hook failed: {}", err
                        );
                    }
                }
                Some(cmd) = ctx.commands.recv() => {
                    let action = match cmd.name.as_str() {
                        "mute" => "mute",
                        "unmute" => "unmute",
                        _ => continue,
                    };
                    let _ = endpoint.api("uuid_audio", &[endpoint.uuid(), action]).await;
                }
                _ = ctx.killed.cancelled() => {
                    let _ = endpoint
                        .api("stop_transcription", &[endpoint.uuid()])
                        .await;
                    ctx.notify_verb_status(TaskKind::Transcribe, "end");
                    return Ok(());
                }
            }
        }
    }
}
