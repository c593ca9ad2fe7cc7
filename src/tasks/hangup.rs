use super::{Precondition, Task, TaskContext, TaskKind};
use crate::session::SessionNotice;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Terminal verb: end the call, optionally attaching SIP headers to the
/// BYE.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupParams {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct HangupTask {
    params: HangupParams,
}

impl HangupTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        Ok(Self {
            params: serde_json::from_value(data.clone())?,
        })
    }
}

#[async_trait]
impl Task for HangupTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Hangup
    }

    fn preconditions(&self) -> Precondition {
        Precondition::StableCall
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        info!(call_sid = ctx.call_sid, "hangup verb");
        ctx.dialog.hangup(&self.params.headers).await?;
        let _ = ctx.notices.send(SessionNotice::Terminate {
            reason: self
                .params
                .reason
                .clone()
                .unwrap_or_else(|| "hangup verb".to_string()),
        });
        Ok(())
    }
}
