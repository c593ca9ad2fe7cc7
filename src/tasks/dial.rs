use super::{Precondition, Task, TaskContext, TaskKind};
use crate::hook::{Hook, HookSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

/// Bridge the caller to an outdialed leg via the media server. The outcome
/// (answered / no-answer / failure) is reported through the action hook;
/// with no alternate target a failed dial ends the task in error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialParams {
    pub target: Vec<DialTarget>,
    #[serde(default)]
    pub action_hook: Option<HookSpec>,
    #[serde(default)]
    pub caller_id: Option<String>,
    /// Seconds to wait for an answer per target.
    #[serde(default = "default_answer_timeout")]
    pub timeout: u64,
}

fn default_answer_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialTarget {
    #[serde(rename = "type", default = "default_target_type")]
    pub target_type: String,
    pub number: Option<String>,
    pub sip_uri: Option<String>,
}

fn default_target_type() -> String {
    "phone".to_string()
}

impl DialTarget {
    fn destination(&self) -> Option<&str> {
        self.sip_uri.as_deref().or(self.number.as_deref())
    }
}

pub struct DialTask {
    params: DialParams,
    action_hook: Option<Hook>,
}

impl DialTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        let params: DialParams = serde_json::from_value(data.clone())?;
        if params.target.is_empty() {
            return Err(anyhow!("dial requires at least one target"));
        }
        let action_hook = params.action_hook.clone().map(Hook::from);
        Ok(Self {
            params,
            action_hook,
        })
    }
}

#[async_trait]
impl Task for DialTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Dial
    }

    fn preconditions(&self) -> Precondition {
        Precondition::StableCall
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let endpoint = ctx.endpoint()?.clone();
        ctx.notify_verb_status(TaskKind::Dial, "begin");

        let mut answer_rx = endpoint.subscribe_event("channel_answer");
        let mut hangup_rx = endpoint.subscribe_event("channel_hangup");
        let mut last_failure = String::from("no targets attempted");

        for target in &self.params.target {
            let Some(destination) = target.destination() else {
                warn!(call_sid = ctx.call_sid, "dial target without destination");
                continue;
            };
            info!(call_sid = ctx.call_sid, destination, "dial: originating");
            let caller_id = self.params.caller_id.as_deref().unwrap_or("anonymous");
            endpoint
                .api("originate", &[endpoint.uuid(), destination, caller_id])
                .await?;

            let deadline = Instant::now() + Duration::from_secs(self.params.timeout);
            let outcome = loop {
                tokio::select! {
                    Some(answer) = answer_rx.recv() => break DialOutcome::Answered(answer),
                    Some(hangup) = hangup_rx.recv() => {
                        break DialOutcome::Failed(
                            hangup
                                .get("cause")
                                .and_then(Value::as_str)
                                .unwrap_or("rejected")
                                .to_string(),
                        );
                    }
                    _ = sleep_until(deadline) => break DialOutcome::NoAnswer,
                    _ = ctx.killed.cancelled() => {
                        let _ = endpoint.api("uuid_kill", &[endpoint.uuid()]).await;
                        ctx.notify_verb_status(TaskKind::Dial, "killed");
                        return Ok(());
                    }
                }
            };

            match outcome {
                DialOutcome::Answered(answer) => {
                    info!(call_sid = ctx.call_sid, destination, "dial: answered");
                    let results = json!({
                        "dialCallStatus": "completed",
                        "dialTarget": destination,
                        "answer": answer,
                    });
                    ctx.perform_action(&self.action_hook, TaskKind::Dial, results)
                        .await;
                    // stay bridged until one side ends the leg or we are killed
                    tokio::select! {
                        _ = hangup_rx.recv() => {}
                        _ = ctx.killed.cancelled() => {
                            let _ = endpoint.api("uuid_kill", &[endpoint.uuid()]).await;
                        }
                    }
                    ctx.notify_verb_status(TaskKind::Dial, "end");
                    return Ok(());
                }
                DialOutcome::NoAnswer => {
                    warn!(call_sid = ctx.call_sid, destination, "dial: no answer");
                    let _ = endpoint.api("uuid_kill", &[endpoint.uuid()]).await;
                    last_failure = "no-answer".to_string();
                }
                DialOutcome::Failed(cause) => {
                    warn!(call_sid = ctx.call_sid, destination, cause, "dial: failed");
                    last_failure = cause;
                }
            }
        }

        let results = json!({
            "dialCallStatus": "failed",
            "reason": last_failure,
        });
        ctx.perform_action(&self.action_hook, TaskKind::Dial, results)
            .await;
        ctx.notify_verb_status(TaskKind::Dial, "end");
        Err(anyhow!("dial failed: {}", last_failure))
    }
}

enum DialOutcome {
    Answered(Value),
    NoAnswer,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::MockEndpoint;
    use crate::tasks::testing::test_context;
    use serde_json::json;

    #[test]
    fn test_dial_requires_target() {
        assert!(DialTask::from_value(&json!({"target": []})).is_err());
    }

    #[tokio::test]
    async fn test_dial_answer_then_remote_hangup() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task = DialTask::from_value(
            &json!({"target": [{"type": "phone", "number": "15551234567"}], "timeout": 10}),
        )
        .unwrap();

        let ep = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ep.push_event("channel_answer", json!({"sip_status": 200}));
            tokio::time::sleep(Duration::from_millis(20)).await;
            ep.push_event("channel_hangup", json!({"cause": "NORMAL_CLEARING"}));
        });

        task.exec(&mut ctx).await.unwrap();
        assert_eq!(endpoint.api_call_count("originate"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_no_answer_errors_without_alternates() {
        let endpoint = MockEndpoint::new();
        let (mut ctx, _harness) = test_context(Some(endpoint.clone()));
        let mut task = DialTask::from_value(
            &json!({"target": [{"type": "phone", "number": "15550000000"}], "timeout": 1}),
        )
        .unwrap();
        let result = task.exec(&mut ctx).await;
        assert!(result.is_err());
        assert_eq!(endpoint.api_call_count("uuid_kill"), 1);
    }
}
