use super::{CallSession, SessionState};
use crate::event::AppCommand;
use crate::hook::Hook;
use crate::requestor::MsgType;
use crate::tasks::TaskCommand;
use crate::utils;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

impl CallSession {
    /// Dispatch one inbound application command. Redirects replace (or,
    /// with `queueCommand`, append to) the application; audio toggles go to
    /// the current verb when it can handle them, otherwise to the session;
    /// everything unrecognized earns a `jambonz:error` reply.
    pub(crate) async fn dispatch_command(&mut self, cmd: AppCommand) {
        debug!(
            call_sid = self.call_sid,
            command = cmd.command,
            queued = cmd.queue_command,
            "app command"
        );
        match cmd.command.as_str() {
            "redirect" => match &cmd.data {
                Value::Array(verbs) => {
                    let verbs = verbs.clone();
                    if cmd.queue_command {
                        match crate::tasks::make_task_list(&verbs) {
                            Ok(tasks) => {
                                debug!(
                                    call_sid = self.call_sid,
                                    count = tasks.len(),
                                    "appending queued verbs"
                                );
                                self.tasks.extend(tasks);
                            }
                            Err(err) => self.reply_error(format!("invalid application: {}", err)),
                        }
                    } else {
                        self.replace_application(verbs);
                    }
                }
                Value::String(url) => {
                    self.redirect_to_url(Hook::new(url.clone())).await;
                }
                Value::Object(_) => {
                    match serde_json::from_value::<crate::hook::HookSpec>(cmd.data.clone()) {
                        Ok(spec) => self.redirect_to_url(Hook::from(spec)).await,
                        Err(err) => self.reply_error(format!("bad redirect target: {}", err)),
                    }
                }
                _ => {
                    self.reply_error(
                        "redirect requires an array of verbs or a hook target".to_string(),
                    );
                }
            },
            "hangup" => {
                info!(call_sid = self.call_sid, "hangup commanded by application");
                self.ended_reason = "terminated by app".to_string();
                self.state = SessionState::Ending;
                if let Some(current) = &self.current {
                    current.kill.cancel();
                }
            }
            "mute" | "unmute" | "pause" | "resume" => {
                let name = cmd.command.clone();
                if self.route_to_current(&name, cmd.data) {
                    return;
                }
                if matches!(name.as_str(), "mute" | "unmute") {
                    self.muted = name == "mute";
                    info!(
                        call_sid = self.call_sid,
                        muted = self.muted,
                        "session audio state"
                    );
                    if let Some(endpoint) = &self.endpoint {
                        let _ = endpoint
                            .api("uuid_audio", &[endpoint.uuid(), name.as_str()])
                            .await;
                    }
                }
            }
            other => {
                if self.route_to_current(other, cmd.data.clone()) {
                    return;
                }
                warn!(
                    call_sid = self.call_sid,
                    command = other,
                    "command not handled by current verb"
                );
                self.reply_error(format!("unsupported command '{}'", other));
            }
        }
    }

    /// Redirect to a new application URL: fetch it with `session:redirect`
    /// and replace the remaining verbs with whatever it returns. A target
    /// on the other transport triggers a handover and closes this one.
    async fn redirect_to_url(&mut self, hook: Hook) {
        match self
            .requestor
            .request(MsgType::SessionRedirect, &hook, self.base_params(), None)
            .await
        {
            Ok(response) => match response.as_verbs() {
                Some(verbs) if !verbs.is_empty() => {
                    self.replace_application(verbs.clone());
                }
                _ => {
                    warn!(
                        call_sid = self.call_sid,
                        url = hook.url,
                        "redirect returned no application"
                    );
                }
            },
            Err(err) => {
                warn!(
                    call_sid = self.call_sid,
                    url = hook.url,
                    "redirect failed: {}",
                    err
                );
            }
        }
    }

    fn route_to_current(&self, name: &str, data: Value) -> bool {
        if let Some(current) = &self.current {
            if current.kind.handles_command(name) {
                let _ = current.cmd_tx.send(TaskCommand {
                    name: name.to_string(),
                    data,
                });
                return true;
            }
        }
        false
    }

    /// Best-effort diagnostics back to the application; meaningful over
    /// WebSocket only and suppressed by the HTTP transport.
    pub(crate) fn reply_error(&self, detail: String) {
        let requestor = self.requestor.clone();
        let hook = Hook::new(self.requestor.base_url().as_str());
        utils::spawn(async move {
            let _ = requestor
                .request(MsgType::JambonzError, &hook, json!({"error": detail}), None)
                .await;
        });
    }
}
