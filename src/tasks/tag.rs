use super::{Precondition, Task, TaskContext, TaskKind};
use crate::session::SessionNotice;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Merge customer-supplied data into the session; it rides along on every
/// subsequent hook payload under `customerData`.
pub struct TagTask {
    data: Value,
}

impl TagTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        let data = data.get("data").cloned().unwrap_or_else(|| data.clone());
        if !data.is_object() {
            return Err(anyhow!("tag data must be an object"));
        }
        Ok(Self { data })
    }
}

#[async_trait]
impl Task for TagTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Tag
    }

    fn preconditions(&self) -> Precondition {
        Precondition::None
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        debug!(call_sid = ctx.call_sid, "tag verb");
        let _ = ctx
            .notices
            .send(SessionNotice::MergeCustomerData(self.data.take()));
        Ok(())
    }
}
