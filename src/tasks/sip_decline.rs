use super::{Precondition, Task, TaskContext, TaskKind};
use crate::session::SessionNotice;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Reject an unanswered call with a final SIP response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipDeclineParams {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_status() -> u16 {
    603
}

pub struct SipDeclineTask {
    params: SipDeclineParams,
}

impl SipDeclineTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        Ok(Self {
            params: serde_json::from_value(data.clone())?,
        })
    }
}

#[async_trait]
impl Task for SipDeclineTask {
    fn kind(&self) -> TaskKind {
        TaskKind::SipDecline
    }

    fn preconditions(&self) -> Precondition {
        Precondition::UnansweredCall
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        info!(
            call_sid = ctx.call_sid,
            status = self.params.status,
            "sip:decline"
        );
        ctx.dialog
            .decline(
                self.params.status,
                self.params.reason.as_deref(),
                &self.params.headers,
            )
            .await?;
        let _ = ctx.notices.send(SessionNotice::Terminate {
            reason: format!("declined with {}", self.params.status),
        });
        Ok(())
    }
}
