pub mod alert;
pub mod app;
pub mod config;
pub mod error;
pub mod event;
pub mod hook;
pub mod media;
pub mod metrics;
pub mod requestor;
pub mod session;
pub mod tasks;
pub mod utils;

pub use error::HookError;

pub fn get_timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
