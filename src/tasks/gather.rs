use super::{Precondition, Task, TaskContext, TaskKind};
use crate::hook::{Hook, HookSpec};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Collect DTMF digits and/or a speech transcript from the caller, then
/// report the result through the action hook.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatherParams {
    #[serde(default = "default_input")]
    pub input: Vec<String>,
    #[serde(default)]
    pub action_hook: Option<HookSpec>,
    #[serde(default)]
    pub num_digits: Option<usize>,
    #[serde(default = "default_min_digits")]
    pub min_digits: usize,
    #[serde(default)]
    pub max_digits: Option<usize>,
    #[serde(default)]
    pub finish_on_key: Option<String>,
    /// Seconds to wait for first input after the prompt.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Seconds allowed between digits once input began; 0 disables.
    #[serde(default)]
    pub inter_digit_timeout: u64,
    /// Optional prompt played before (and during) collection.
    #[serde(default)]
    pub say: Option<super::say::SayParams>,
    #[serde(default)]
    pub play: Option<super::play::PlayParams>,
}

fn default_input() -> Vec<String> {
    vec!["digits".to_string()]
}

fn default_min_digits() -> usize {
    1
}

fn default_timeout() -> u64 {
    5
}

pub struct GatherTask {
    params: GatherParams,
    action_hook: Option<Hook>,
}

impl GatherTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        let params: GatherParams = serde_json::from_value(data.clone())?;
        let action_hook = params.action_hook.clone().map(Hook::from);
        Ok(Self {
            params,
            action_hook,
        })
    }

    fn wants(&self, mode: &str) -> bool {
        self.params.input.iter().any(|i| i == mode)
    }

    fn max_digits(&self) -> usize {
        self.params
            .num_digits
            .or(self.params.max_digits)
            .unwrap_or(usize::MAX)
    }
}

#[async_trait]
impl Task for GatherTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Gather
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let endpoint = ctx.endpoint()?.clone();
        ctx.notify_verb_status(TaskKind::Gather, "begin");

        let mut dtmf_rx = endpoint.subscribe_dtmf();
        let mut transcript_rx = endpoint.subscribe_event("transcript");
        let collect_speech = self.wants("speech");
        let collect_digits = self.wants("digits");

        // prompt runs concurrently so the caller can barge in
        let prompt_url = match (&self.params.say, &self.params.play, &ctx.tts) {
            (Some(say), _, Some(tts)) => {
                let path = tts.synthesize(&say.text, say.voice.as_deref()).await?;
                let _ = ctx
                    .notices
                    .send(crate::session::SessionNotice::TrackTmpFile(path.clone()));
                Some(path.to_string_lossy().to_string())
            }
            (None, Some(play), _) => Some(play.url.clone()),
            _ => None,
        };
        let mut prompting = prompt_url.as_ref().map(|url| {
            let endpoint = endpoint.clone();
            let url = url.clone();
            Box::pin(async move { endpoint.play(&url).await })
        });

        let mut digits = String::new();
        let mut deadline = Instant::now() + Duration::from_secs(self.params.timeout);
        let inter_digit = Duration::from_secs(self.params.inter_digit_timeout);
        let max_digits = self.max_digits();

        let reason = loop {
            tokio::select! {
                r = async {
                    match prompting.as_mut() {
                        Some(p) => p.await,
                        None => std::future::pending().await,
                    }
                } => {
                    r?;
                    prompting = None;
                    // the answer window opens once the prompt finishes
                    deadline = Instant::now() + Duration::from_secs(self.params.timeout);
                }
                Some(dtmf) = dtmf_rx.recv(), if collect_digits => {
                    if prompting.is_some() {
                        // barge-in: stop the prompt, keep collecting
                        let _ = endpoint.api("uuid_break", &[endpoint.uuid()]).await;
                        prompting = None;
                    }
                    if self
                        .params
                        .finish_on_key
                        .as_deref()
                        .map(|k| k.contains(dtmf.digit))
                        .unwrap_or(false)
                    {
                        break "dtmfDetected";
                    }
                    digits.push(dtmf.digit);
                    debug!(call_sid = ctx.call_sid, digits, "gather: digit");
                    if digits.len() >= max_digits {
                        break "dtmfDetected";
                    }
                    if !inter_digit.is_zero() {
                        deadline = Instant::now() + inter_digit;
                    }
                }
                Some(transcript) = transcript_rx.recv(), if collect_speech => {
                    let is_final = transcript
                        .get("is_final")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if is_final {
                        info!(call_sid = ctx.call_sid, "gather: speech final");
                        let results = json!({
                            "reason": "speechDetected",
                            "speech": transcript,
                        });
                        ctx.perform_action(&self.action_hook, TaskKind::Gather, results)
                            .await;
                        ctx.notify_verb_status(TaskKind::Gather, "end");
                        return Ok(());
                    }
                }
                _ = sleep_until(deadline), if prompting.is_none() => {
                    break "timeout";
                }
                _ = ctx.killed.cancelled() => {
                    let _ = endpoint.api("uuid_break", &[endpoint.uuid()]).await;
                    ctx.notify_verb_status(TaskKind::Gather, "killed");
                    return Ok(());
                }
            }
        };

        if digits.len() < self.params.min_digits && reason != "timeout" {
            debug!(
                call_sid = ctx.call_sid,
                digits, "gather: below minimum digits"
            );
        }
        let results = json!({
            "reason": reason,
            "digits": digits,
        });
        ctx.perform_action(&self.action_hook, TaskKind::Gather, results)
            .await;
        ctx.notify_verb_status(TaskKind::Gather, "end");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::MockEndpoint;
    use crate::tasks::testing::test_context;
    use serde_json::json;

    #[test]
    fn test_gather_params_defaults() {
        let task = GatherTask::from_value(&json!({})).unwrap();
        assert!(task.wants("digits"));
        assert!(!task.wants("speech"));
        assert_eq!(task.params.timeout, 5);
        assert_eq!(task.params.min_digits, 1);
    }

    #[tokio::test]
    async fn test_gather_collects_until_num_digits() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task = GatherTask::from_value(&json!({"numDigits": 3, "timeout": 5})).unwrap();

        let ep = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ep.push_dtmf('4');
            ep.push_dtmf('2');
            ep.push_dtmf('7');
        });

        task.exec(&mut ctx).await.unwrap();
        // no action hook configured, nothing to assert beyond completion
    }

    #[tokio::test]
    async fn test_gather_finish_on_key() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task =
            GatherTask::from_value(&json!({"finishOnKey": "#", "numDigits": 10, "timeout": 5}))
                .unwrap();

        let ep = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ep.push_dtmf('1');
            ep.push_dtmf('#');
        });

        let started = std::time::Instant::now();
        task.exec(&mut ctx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_times_out() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task = GatherTask::from_value(&json!({"timeout": 2})).unwrap();
        task.exec(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_gather_speech_final_resolves() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task = GatherTask::from_value(&json!({"input": ["speech"], "timeout": 5})).unwrap();

        let ep = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ep.push_event(
                "transcript",
                json!({"is_final": true, "alternatives": [{"transcript": "main menu"}]}),
            );
        });

        let started = std::time::Instant::now();
        task.exec(&mut ctx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
