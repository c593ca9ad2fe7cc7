use super::{Precondition, Task, TaskContext, TaskKind};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

/// Play an audio URL (or file path the media server can reach).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayParams {
    pub url: String,
    #[serde(default = "default_loop_count", rename = "loop")]
    pub loop_count: u32,
}

fn default_loop_count() -> u32 {
    1
}

pub struct PlayTask {
    params: PlayParams,
}

impl PlayTask {
    pub fn from_value(data: &Value) -> Result<Self> {
        Ok(Self {
            params: serde_json::from_value(data.clone())?,
        })
    }
}

#[async_trait]
impl Task for PlayTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Play
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let endpoint = ctx.endpoint()?.clone();
        ctx.notify_verb_status(TaskKind::Play, "begin");
        info!(
            call_sid = ctx.call_sid,
            url = self.params.url,
            loops = self.params.loop_count,
            "play"
        );
        for _ in 0..self.params.loop_count.max(1) {
            let mut playing = Box::pin(endpoint.play(&self.params.url));
            loop {
                tokio::select! {
                    r = &mut playing => {
                        r?;
                        break;
                    }
                    Some(cmd) = ctx.commands.recv() => {
                        // pause/resume of the in-progress file
                        let action = match cmd.name.as_str() {
                            "pause" => "pause",
                            "resume" => "resume",
                            _ => continue,
                        };
                        let _ = endpoint.api("uuid_fileman", &[endpoint.uuid(), action]).await;
                    }
                    _ = ctx.killed.cancelled() => {
                        let _ = endpoint.api("uuid_break", &[endpoint.uuid()]).await;
                        ctx.notify_verb_status(TaskKind::Play, "killed");
                        return Ok(());
                    }
                }
            }
        }
        ctx.notify_verb_status(TaskKind::Play, "end");
        Ok(())
    }
}
