use super::{Precondition, Task, TaskContext, TaskKind};
use crate::session::{SessionNotice, SessionSettings};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Mutate session-level defaults (synthesizer, recognizer, event
/// notification). Never fails the call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParams {
    #[serde(default)]
    pub notify_events: Option<bool>,
    #[serde(default)]
    pub synthesizer: Option<Value>,
    #[serde(default)]
    pub recognizer: Option<Value>,
}

pub struct ConfigTask {
    params: ConfigParams,
}

impl ConfigTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        Ok(Self {
            params: serde_json::from_value(data.clone())?,
        })
    }
}

#[async_trait]
impl Task for ConfigTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Config
    }

    fn preconditions(&self) -> Precondition {
        Precondition::None
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        debug!(call_sid = ctx.call_sid, "config verb");
        let _ = ctx
            .notices
            .send(SessionNotice::ApplySettings(SessionSettings {
                notify_events: self.params.notify_events,
                synthesizer: self.params.synthesizer.take(),
                recognizer: self.params.recognizer.take(),
            }));
        Ok(())
    }
}
