use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Keys whose nested object is forwarded to webhooks verbatim. The key
/// itself is still snake-cased; everything beneath it is customer-owned
/// data and must not be rewritten.
const PRESERVED_KEYS: &[&str] = &["customerData", "sip", "env_vars", "args"];

/// Recursively snake-case all object keys of a JSON value, leaving the
/// subtrees of [`PRESERVED_KEYS`] untouched.
pub fn snakecase_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if PRESERVED_KEYS.contains(&k.as_str()) {
                    out.insert(to_snake(k), v.clone());
                } else {
                    out.insert(to_snake(k), snakecase_keys(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(snakecase_keys).collect()),
        other => other.clone(),
    }
}

fn to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

/// Generate a short message id for ack correlation.
pub fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

pub struct TaskGuard {
    pub loc: String,
}

pub static GLOBAL_TASK_METRICS: once_cell::sync::Lazy<Arc<Mutex<HashMap<String, usize>>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(HashMap::new())));

impl TaskGuard {
    pub fn new(loc: String) -> Self {
        if let Ok(mut metrics) = GLOBAL_TASK_METRICS.lock() {
            *metrics.entry(loc.clone()).or_insert(0) += 1;
        }
        Self { loc }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Ok(mut metrics) = GLOBAL_TASK_METRICS.lock() {
            if let Some(count) = metrics.get_mut(&self.loc) {
                if *count > 0 {
                    *count -= 1;
                }
            }
        }
    }
}

/// Spawn wrapper that records the spawn site while the task is live, so a
/// leaked per-call task can be traced back to its origin.
#[track_caller]
pub fn spawn<T>(future: T) -> tokio::task::JoinHandle<T::Output>
where
    T: std::future::Future + Send + 'static,
    T::Output: Send + 'static,
{
    let location = std::panic::Location::caller();
    let loc = format!("{}:{}", location.file(), location.line());
    let _guard = TaskGuard::new(loc);
    tokio::spawn(async move {
        let _guard = _guard;
        future.await
    })
}
