use crate::alert::{Alert, AlertEmitter};
use crate::app::AppContextBuilder;
use crate::config::Config;
use crate::event::RequestorEventReceiver;
use crate::requestor::RequestorCore;
use tokio::sync::mpsc;
use url::Url;


/// Honor RUST_LOG in test runs; safe to call repeatedly.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Requestor identity against a loopback app, with the alert and event
/// drains handed back for assertions.
pub(crate) fn test_core(
    base_url: &str,
    config: Config,
) -> (
    RequestorCore,
    RequestorEventReceiver,
    mpsc::UnboundedReceiver<Alert>,
) {
    init_logging();
    let (alerts, alert_rx) = AlertEmitter::with_sink();
    let app = AppContextBuilder::new()
        .config(config)
        .alerts(alerts.clone())
        .build();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let core = RequestorCore {
        account_sid: "acct-test".to_string(),
        call_sid: "call-test".to_string(),
        secret: None,
        base_url: Url::parse(base_url).expect("test url"),
        config: app.config.clone(),
        alerts,
        events: event_tx,
        http_pool: app.http_pool.clone(),
    };
    (core, event_rx, alert_rx)
}

/// Bind an axum app on an ephemeral loopback port and serve it.
pub(crate) async fn spawn_app(router: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}
