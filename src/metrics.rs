pub mod webhook {
    /// Increment when a webhook request attempt is made
    pub fn attempt(transport: &str) {
        metrics::counter!(
            "rustcall_webhook_requests_total",
            "transport" => transport.to_string()
        )
        .increment(1);
    }

    /// Increment when a webhook request fails after retries
    pub fn failure(transport: &str, class: &str) {
        metrics::counter!(
            "rustcall_webhook_failures_total",
            "transport" => transport.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Observe end-to-end webhook latency in milliseconds
    pub fn latency(transport: &str, millis: f64) {
        metrics::histogram!(
            "rustcall_webhook_latency_ms",
            "transport" => transport.to_string()
        )
        .record(millis);
    }
}

pub mod ws {
    /// Increment per successful WebSocket connection, reconnects included
    pub fn connected(reconnect: bool) {
        metrics::counter!(
            "rustcall_ws_connections_total",
            "reconnect" => if reconnect { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Increment when a peer is marked malicious and the socket is closed
    pub fn malicious_close() {
        metrics::counter!("rustcall_ws_malicious_closes_total").increment(1);
    }

    /// Set the number of live WebSocket application channels
    pub fn set_active(count: usize) {
        metrics::gauge!("rustcall_ws_active_connections").set(count as f64);
    }
}

pub mod session {
    pub fn started() {
        metrics::counter!("rustcall_sessions_started_total").increment(1);
        metrics::gauge!("rustcall_sessions_active").increment(1.0);
    }

    pub fn ended(reason: &str) {
        metrics::counter!(
            "rustcall_sessions_ended_total",
            "reason" => reason.to_string()
        )
        .increment(1);
        metrics::gauge!("rustcall_sessions_active").decrement(1.0);
    }

    /// Observe full session duration in seconds
    pub fn duration(secs: f64) {
        metrics::histogram!("rustcall_session_duration_seconds").record(secs);
    }

    /// Observe a single task execution in milliseconds
    pub fn task_duration(kind: &str, millis: f64) {
        metrics::histogram!(
            "rustcall_task_duration_ms",
            "task" => kind.to_string()
        )
        .record(millis);
    }

    pub fn application_replaced() {
        metrics::counter!("rustcall_application_replacements_total").increment(1);
    }
}

pub mod alerts {
    pub fn raised(kind: &str) {
        metrics::counter!(
            "rustcall_alerts_total",
            "kind" => kind.to_string()
        )
        .increment(1);
    }
}
