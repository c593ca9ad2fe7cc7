use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A DTMF digit detected on the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DtmfEvent {
    pub digit: char,
    pub duration_ms: u64,
}

/// One media-server-side handle through which audio is played, recorded and
/// manipulated for a single call leg.
///
/// Any backend exposing this surface works; nothing in the session layer
/// assumes a particular media-server flavor.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    fn uuid(&self) -> &str;
    fn connected(&self) -> bool;

    /// Issue a raw command against the media server.
    async fn api(&self, verb: &str, args: &[&str]) -> Result<Value>;

    /// Play an audio file or URL to completion.
    async fn play(&self, path: &str) -> Result<()>;

    /// Set a channel variable.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Subscribe to a named custom event stream.
    fn subscribe_event(&self, name: &str) -> mpsc::UnboundedReceiver<Value>;

    /// Subscribe to DTMF digits.
    fn subscribe_dtmf(&self) -> mpsc::UnboundedReceiver<DtmfEvent>;

    /// Release the endpoint. Idempotent.
    async fn destroy(&self) -> Result<()>;
}

/// Allocator for media endpoints, one per feature-server process.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn allocate(&self, call_sid: &str) -> Result<Arc<dyn MediaEndpoint>>;
}

/// External text-to-speech synthesis. Produces an audio file the endpoint
/// can play; the session owns deletion of the returned file.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<PathBuf>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scriptable in-memory endpoint used by task and session tests.
    pub struct MockEndpoint {
        uuid: String,
        connected: AtomicBool,
        pub api_calls: Mutex<Vec<(String, Vec<String>)>>,
        pub played: Mutex<Vec<String>>,
        pub destroy_count: AtomicUsize,
        pub play_delay: Mutex<Duration>,
        dtmf_subscribers: Mutex<Vec<mpsc::UnboundedSender<DtmfEvent>>>,
        event_subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
    }

    impl MockEndpoint {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                uuid: uuid::Uuid::new_v4().to_string(),
                connected: AtomicBool::new(true),
                api_calls: Mutex::new(Vec::new()),
                played: Mutex::new(Vec::new()),
                destroy_count: AtomicUsize::new(0),
                play_delay: Mutex::new(Duration::ZERO),
                dtmf_subscribers: Mutex::new(Vec::new()),
                event_subscribers: Mutex::new(HashMap::new()),
            })
        }

        pub fn push_dtmf(&self, digit: char) {
            let subs = self.dtmf_subscribers.lock().unwrap();
            for tx in subs.iter() {
                let _ = tx.send(DtmfEvent {
                    digit,
                    duration_ms: 100,
                });
            }
        }

        pub fn push_event(&self, name: &str, value: Value) {
            let subs = self.event_subscribers.lock().unwrap();
            if let Some(list) = subs.get(name) {
                for tx in list {
                    let _ = tx.send(value.clone());
                }
            }
        }

        pub fn api_call_count(&self, verb: &str) -> usize {
            self.api_calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(v, _)| v == verb)
                .count()
        }
    }

    #[async_trait]
    impl MediaEndpoint for MockEndpoint {
        fn uuid(&self) -> &str {
            &self.uuid
        }

        fn connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn api(&self, verb: &str, args: &[&str]) -> Result<Value> {
            self.api_calls.lock().unwrap().push((
                verb.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(Value::String("+OK".to_string()))
        }

        async fn play(&self, path: &str) -> Result<()> {
            self.played.lock().unwrap().push(path.to_string());
            let delay = *self.play_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.api_calls
                .lock()
                .unwrap()
                .push(("set".to_string(), vec![key.to_string(), value.to_string()]));
            Ok(())
        }

        fn subscribe_event(&self, name: &str) -> mpsc::UnboundedReceiver<Value> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.event_subscribers
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(tx);
            rx
        }

        fn subscribe_dtmf(&self) -> mpsc::UnboundedReceiver<DtmfEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.dtmf_subscribers.lock().unwrap().push(tx);
            rx
        }

        async fn destroy(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.destroy_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct MockMediaServer {
        pub endpoint: Arc<MockEndpoint>,
        pub allocations: AtomicUsize,
    }

    impl MockMediaServer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                endpoint: MockEndpoint::new(),
                allocations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MediaServer for MockMediaServer {
        async fn allocate(&self, _call_sid: &str) -> Result<Arc<dyn MediaEndpoint>> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.endpoint.clone())
        }
    }

    /// TTS double that writes a placeholder file so temp-file tracking and
    /// cleanup can be observed.
    pub struct MockTts;

    #[async_trait]
    impl TtsEngine for MockTts {
        async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<PathBuf> {
            let path =
                std::env::temp_dir().join(format!("rustcall-tts-{}.wav", uuid::Uuid::new_v4()));
            tokio::fs::write(&path, text.as_bytes()).await?;
            Ok(path)
        }
    }
}
