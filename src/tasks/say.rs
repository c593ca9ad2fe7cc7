use super::{Precondition, Task, TaskContext, TaskKind};
use crate::session::SessionNotice;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

/// Speak text to the caller via external synthesis. The synthesized file is
/// tracked with the session for deletion at teardown.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SayParams {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_loop_count", rename = "loop")]
    pub loop_count: u32,
    #[serde(default)]
    pub early_media: bool,
}

fn default_loop_count() -> u32 {
    1
}

pub struct SayTask {
    params: SayParams,
}

impl SayTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        let params: SayParams = serde_json::from_value(data.clone())?;
        Ok(Self { params })
    }
}

#[async_trait]
impl Task for SayTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Say
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let endpoint = ctx.endpoint()?.clone();
        let tts = match &ctx.tts {
            Some(tts) => tts.clone(),
            None => {
                warn!(call_sid = ctx.call_sid, "say: no synthesizer configured");
                return Ok(());
            }
        };
        ctx.notify_verb_status(TaskKind::Say, "begin");

        let voice = self
            .params
            .voice
            .as_deref()
            .or_else(|| ctx.default_voice())
            .map(|v| v.to_string());
        let path = tts.synthesize(&self.params.text, voice.as_deref()).await?;
        let _ = ctx.notices.send(SessionNotice::TrackTmpFile(path.clone()));
        let file = path.to_string_lossy().to_string();

        info!(
            call_sid = ctx.call_sid,
            loops = self.params.loop_count,
            "say: playing synthesized audio"
        );
        for _ in 0..self.params.loop_count.max(1) {
            tokio::select! {
                r = endpoint.play(&file) => r?,
                _ = ctx.killed.cancelled() => {
                    // stop whatever is on the channel before resolving
                    let _ = endpoint.api("uuid_break", &[endpoint.uuid()]).await;
                    ctx.notify_verb_status(TaskKind::Say, "killed");
                    return Ok(());
                }
            }
        }
        ctx.notify_verb_status(TaskKind::Say, "end");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{MockEndpoint, MockTts};
    use crate::tasks::testing::test_context;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_say_params_parse() {
        let task = SayTask::from_value(&json!({"text": "hello", "loop": 2})).unwrap();
        assert_eq!(task.params.text, "hello");
        assert_eq!(task.params.loop_count, 2);
    }

    #[tokio::test]
    async fn test_say_plays_synthesized_file_and_tracks_it() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, mut harness) = test_context(Some(endpoint.clone()));
        ctx.tts = Some(Arc::new(MockTts));

        let mut task = SayTask::from_value(&json!({"text": "hello world"})).unwrap();
        task.exec(&mut ctx).await.unwrap();

        assert_eq!(endpoint.played.lock().unwrap().len(), 1);
        // the synthesized file must be handed to the session for cleanup
        let notice = harness.notices.try_recv().unwrap();
        assert!(matches!(notice, SessionNotice::TrackTmpFile(_)));
    }

    #[tokio::test]
    async fn test_say_kill_breaks_playback() {
        let endpoint = MockEndpoint::new();
        *endpoint.play_delay.lock().unwrap() = Duration::from_secs(5);
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        ctx.tts = Some(Arc::new(MockTts));

        let killed = ctx.killed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killed.cancel();
        });

        let mut task = SayTask::from_value(&json!({"text": "long speech"})).unwrap();
        let started = std::time::Instant::now();
        task.exec(&mut ctx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(endpoint.api_call_count("uuid_break"), 1);
    }
}
