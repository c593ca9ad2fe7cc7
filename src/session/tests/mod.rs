use crate::alert::AlertEmitter;
use crate::app::{AppContext, AppContextBuilder};
use crate::config::Config;
use crate::hook::Hook;
use crate::media::testing::{MockMediaServer, MockTts};
use crate::session::{CallDirection, CallSession, CallerInfo};
use crate::tasks::testing::MockDialog;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn spawn_app(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

async fn read_json(socket: &mut WebSocket) -> Option<Value> {
    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).ok();
        }
    }
    None
}

async fn send_json(socket: &mut WebSocket, value: Value) {
    socket
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .ok();
}

fn caller() -> CallerInfo {
    CallerInfo {
        call_id: "abc123@10.0.0.1".to_string(),
        from: "+15551112222".to_string(),
        to: "+15553334444".to_string(),
        direction: CallDirection::Inbound,
        caller_name: None,
    }
}

fn test_app() -> AppContext {
    AppContextBuilder::new()
        .config(Config::default())
        .alerts(AlertEmitter::logging())
        .build()
}

struct Fixture {
    media: Arc<MockMediaServer>,
    dialog: Arc<MockDialog>,
}

fn build_session(base_url: &str, application: Vec<Value>) -> (CallSession, Fixture) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let media = MockMediaServer::new();
    let dialog = MockDialog::new(false);
    let mut builder = CallSession::builder(test_app())
        .call_sid("call-1")
        .account_sid("acct-1")
        .caller_info(caller())
        .dialog(dialog.clone())
        .media(media.clone())
        .tts(Arc::new(MockTts))
        .base_url(base_url);
    if application.is_empty() {
        builder = builder.app_hook(Hook::new(base_url));
    }
    let session = builder.application(application).build().expect("session");
    (session, Fixture { media, dialog })
}

#[tokio::test]
async fn test_session_runs_tasks_serially_then_tears_down() {
    let (session, fixture) = build_session(
        "http://127.0.0.1:9/hooks",
        vec![
            json!({"play": {"url": "welcome.wav"}}),
            json!({"hangup": {}}),
        ],
    );
    let record = session.exec().await.unwrap();

    assert_eq!(record.reason, "hangup verb");
    assert!(record.answered);
    assert_eq!(fixture.dialog.answers.load(Ordering::SeqCst), 1);
    // endpoint released exactly once
    assert_eq!(
        fixture.media.endpoint.destroy_count.load(Ordering::SeqCst),
        1
    );
    assert_eq!(
        fixture.media.endpoint.played.lock().unwrap().as_slice(),
        ["welcome.wav"]
    );
}

#[tokio::test]
async fn test_action_hook_array_replaces_remaining_application() {
    // gather's action hook answers with a one-verb application
    let seen_body = Arc::new(Mutex::new(None::<Value>));
    let seen_in_app = seen_body.clone();
    let addr = spawn_app(Router::new().route(
        "/action",
        post(move |Json(body): Json<Value>| {
            let seen = seen_in_app.clone();
            async move {
                *seen.lock().unwrap() = Some(body);
                Json(json!([{"play": {"url": "redirected.wav"}}]))
            }
        }),
    ))
    .await;

    let (session, fixture) = build_session(
        &format!("http://{}/", addr),
        vec![
            json!({"gather": {"numDigits": 1, "timeout": 10, "actionHook": format!("http://{}/action", addr)}}),
            json!({"pause": {"length": 60}}),
        ],
    );

    let endpoint = fixture.media.endpoint.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        endpoint.push_dtmf('5');
    });

    let started = std::time::Instant::now();
    let record = session.exec().await.unwrap();

    // the 60s pause was supplanted by the redirect
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(record.application_epoch, 1);
    let body = seen_body.lock().unwrap().clone().expect("action hook hit");
    assert_eq!(body["digits"], "5");
    assert_eq!(body["call_sid"], "call-1");
    assert!(fixture
        .media
        .endpoint
        .played
        .lock()
        .unwrap()
        .contains(&"redirected.wav".to_string()));
}

#[tokio::test]
async fn test_ws_application_with_redirect_and_hangup_commands() {
    let addr = spawn_app(Router::new().route(
        "/socket",
        get(move |ws: WebSocketUpgrade| async move {
            ws.on_upgrade(move |mut socket| async move {
                // session:new -> initial application
                let frame = read_json(&mut socket).await.unwrap();
                assert_eq!(frame["type"], "session:new");
                send_json(
                    &mut socket,
                    json!({
                        "type": "ack",
                        "msgid": frame["msgid"],
                        "data": [{"pause": {"length": 60}}],
                    }),
                )
                .await;
                // supplant the pause immediately
                send_json(
                    &mut socket,
                    json!({
                        "type": "command",
                        "command": "redirect",
                        "data": [{"play": {"url": "from-command.wav"}}, {"pause": {"length": 60}}],
                    }),
                )
                .await;
                tokio::time::sleep(Duration::from_millis(400)).await;
                send_json(&mut socket, json!({"type": "command", "command": "hangup"})).await;
                // keep the socket alive while the session winds down
                tokio::time::sleep(Duration::from_secs(2)).await;
            })
        }),
    ))
    .await;

    let (session, fixture) = build_session(&format!("ws://{}/socket", addr), vec![]);
    let started = std::time::Instant::now();
    let record = session.exec().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(record.reason, "terminated by app");
    assert_eq!(record.application_epoch, 1);
    assert!(fixture
        .media
        .endpoint
        .played
        .lock()
        .unwrap()
        .contains(&"from-command.wav".to_string()));
}

#[tokio::test]
async fn test_ws_queued_redirect_appends_after_current_verb() {
    let addr = spawn_app(Router::new().route(
        "/socket",
        get(move |ws: WebSocketUpgrade| async move {
            ws.on_upgrade(move |mut socket| async move {
                let frame = read_json(&mut socket).await.unwrap();
                send_json(
                    &mut socket,
                    json!({
                        "type": "ack",
                        "msgid": frame["msgid"],
                        "data": [{"pause": {"length": 1}}],
                    }),
                )
                .await;
                send_json(
                    &mut socket,
                    json!({
                        "type": "command",
                        "command": "redirect",
                        "queueCommand": true,
                        "data": [{"play": {"url": "appended.wav"}}],
                    }),
                )
                .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        }),
    ))
    .await;

    let (session, fixture) = build_session(&format!("ws://{}/socket", addr), vec![]);
    let record = session.exec().await.unwrap();

    // appended, not replaced: epoch unchanged, pause ran to completion
    assert_eq!(record.application_epoch, 0);
    assert_eq!(record.reason, "completed");
    assert!(fixture
        .media
        .endpoint
        .played
        .lock()
        .unwrap()
        .contains(&"appended.wav".to_string()));
}

#[tokio::test]
async fn test_redirect_command_with_url_switches_transport() {
    // the redirect target lives on HTTP and answers session:redirect with
    // a replacement application
    let http_addr = spawn_app(Router::new().route(
        "/app",
        post(|Json(_): Json<Value>| async {
            Json(json!([{"play": {"url": "after-redirect.wav"}}]))
        }),
    ))
    .await;

    let redirect_url = format!("http://{}/app", http_addr);
    let ws_addr = spawn_app(Router::new().route(
        "/socket",
        get(move |ws: WebSocketUpgrade| {
            let redirect_url = redirect_url.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    let frame = read_json(&mut socket).await.unwrap();
                    send_json(
                        &mut socket,
                        json!({
                            "type": "ack",
                            "msgid": frame["msgid"],
                            "data": [{"pause": {"length": 60}}],
                        }),
                    )
                    .await;
                    send_json(
                        &mut socket,
                        json!({
                            "type": "command",
                            "command": "redirect",
                            "data": redirect_url,
                        }),
                    )
                    .await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                })
            }
        }),
    ))
    .await;

    let (session, fixture) = build_session(&format!("ws://{}/socket", ws_addr), vec![]);
    let started = std::time::Instant::now();
    let record = session.exec().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(record.reason, "completed");
    assert_eq!(record.application_epoch, 1);
    assert!(fixture
        .media
        .endpoint
        .played
        .lock()
        .unwrap()
        .contains(&"after-redirect.wav".to_string()));
}

#[tokio::test]
async fn test_unsatisfied_precondition_skips_task_and_continues() {
    let (session, fixture) = build_session(
        "http://127.0.0.1:9/hooks",
        vec![
            // answers the call
            json!({"play": {"url": "hi.wav"}}),
            // requires an unanswered call: must be skipped
            json!({"sip:decline": {"status": 486}}),
            json!({"pause": {"length": 0}}),
        ],
    );
    let record = session.exec().await.unwrap();

    assert_eq!(record.reason, "completed");
    assert!(fixture.dialog.declines.lock().unwrap().is_empty());
    assert_eq!(
        fixture.media.endpoint.destroy_count.load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_say_tmp_file_removed_at_teardown() {
    let (session, fixture) = build_session(
        "http://127.0.0.1:9/hooks",
        vec![json!({"say": {"text": "goodbye"}})],
    );
    let record = session.exec().await.unwrap();
    assert_eq!(record.reason, "completed");

    let played = fixture.media.endpoint.played.lock().unwrap().clone();
    assert_eq!(played.len(), 1);
    // the synthesized temp file was deleted during teardown
    assert!(!std::path::Path::new(&played[0]).exists());
}

#[tokio::test]
async fn test_external_cancellation_terminates_session() {
    let (session, fixture) = build_session(
        "http://127.0.0.1:9/hooks",
        vec![json!({"pause": {"length": 60}})],
    );
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let record = session.exec().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(record.reason, "terminated");
    // nothing was ever played and no endpoint was allocated, but teardown
    // still ran cleanly
    assert_eq!(fixture.media.allocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_gather_action_hook_handover_to_ws() {
    let seen = Arc::new(Mutex::new(None::<Value>));
    let seen_in_app = seen.clone();
    let ws_addr = spawn_app(Router::new().route(
        "/socket",
        get(move |ws: WebSocketUpgrade| {
            let seen = seen_in_app.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    if let Some(frame) = read_json(&mut socket).await {
                        send_json(
                            &mut socket,
                            json!({"type": "ack", "msgid": frame["msgid"], "data": {}}),
                        )
                        .await;
                        *seen.lock().unwrap() = Some(frame);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                })
            }
        }),
    ))
    .await;

    let (session, fixture) = build_session(
        "http://127.0.0.1:9/hooks",
        vec![json!({
            "gather": {
                "numDigits": 1,
                "timeout": 10,
                "actionHook": format!("ws://{}/socket", ws_addr),
            }
        })],
    );

    let endpoint = fixture.media.endpoint.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        endpoint.push_dtmf('1');
    });

    let record = session.exec().await.unwrap();
    assert_eq!(record.reason, "completed");

    let frame = seen.lock().unwrap().clone().expect("ws app reached");
    assert_eq!(frame["type"], "session:new");
    assert_eq!(frame["call_sid"], "call-1");
    assert_eq!(frame["data"]["digits"], "1");
}
