use crate::alert::AlertEmitter;
use crate::config::Config;
use crate::requestor::http::HttpClientPool;
use std::sync::Arc;

/// Process-wide shared resources, injected into every session at
/// construction so tests can replace any of them.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub http_pool: Arc<HttpClientPool>,
    pub alerts: AlertEmitter,
}

pub struct AppContextBuilder {
    config: Option<Config>,
    alerts: Option<AlertEmitter>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            alerts: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn alerts(mut self, alerts: AlertEmitter) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> AppContext {
        let config = Arc::new(self.config.unwrap_or_else(Config::from_env));
        AppContext {
            http_pool: Arc::new(HttpClientPool::new(config.clone())),
            alerts: self.alerts.unwrap_or_else(AlertEmitter::logging),
            config,
        }
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
