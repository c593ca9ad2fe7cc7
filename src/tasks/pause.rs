use super::{Precondition, Task, TaskContext, TaskKind};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Wait silently for a number of seconds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseParams {
    #[serde(default = "default_length")]
    pub length: u64,
}

fn default_length() -> u64 {
    1
}

pub struct PauseTask {
    params: PauseParams,
}

impl PauseTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        Ok(Self {
            params: serde_json::from_value(data.clone())?,
        })
    }
}

#[async_trait]
impl Task for PauseTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Pause
    }

    fn preconditions(&self) -> Precondition {
        Precondition::None
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        debug!(
            call_sid = ctx.call_sid,
            length = self.params.length,
            "pause"
        );
        ctx.killable_sleep(Duration::from_secs(self.params.length))
            .await;
        Ok(())
    }
}
