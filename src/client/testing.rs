//! Test doubles shared by the client unit tests.

use crate::client::flow::{OpenerChannel, PopupHandle, PopupOpener, WindowMessage};
use crate::client::http_client::{HttpRequest, HttpResponse, HttpTransport};
use crate::client::runtime::BoxStream;
use crate::client::token_storage::KeyValueStore;
use crate::config::{AuthConfig, StorageBackend};
use crate::error::{AuthError, StorageError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub fn test_config() -> AuthConfig {
    let mut config = AuthConfig::new(
        "https://id.example.com".to_string(),
        "spa-client".to_string(),
        "https://app.example.com/callback".to_string(),
    );
    config.token_validation = false;
    config.storage = StorageBackend::Memory;
    config
}

/// Builds an unsigned JWT carrying `payload`.
pub fn make_jwt(kid: Option<&str>, payload: Value) -> String {
    let mut header = json!({ "alg": "RS256", "typ": "JWT" });
    if let Some(kid) = kid {
        header["kid"] = json!(kid);
    }
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

#[derive(Default)]
struct TransportScript {
    responses: VecDeque<HttpResponse>,
    requests: Vec<HttpRequest>,
}

/// Transport that answers from a queue and records every request.
///
/// An empty queue yields `AuthError::Network`.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    script: Arc<Mutex<TransportScript>>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, to keep requests in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, response: HttpResponse) {
        self.script.lock().responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().requests.clone()
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for RecordingTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        let response = {
            let mut script = self.script.lock();
            script.requests.push(request);
            script.responses.pop_front()
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        response.ok_or_else(|| AuthError::Network("no scripted response".to_string()))
    }
}

/// Store whose writes always fail.
pub struct FailingStore {
    error: StorageError,
}

impl FailingStore {
    pub fn quota_exceeded() -> Self {
        Self {
            error: StorageError::QuotaExceeded,
        }
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(self.error.clone())
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Default)]
struct PopupScript {
    blocked: bool,
    opened: Vec<(String, Arc<AtomicBool>)>,
    listeners: Vec<UnboundedSender<WindowMessage>>,
}

/// Popup opener driven by the test: it records opened URLs and lets the
/// test post messages or close the popups.
#[derive(Clone, Default)]
pub struct ScriptedPopups {
    script: Arc<Mutex<PopupScript>>,
}

impl ScriptedPopups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self) {
        self.script.lock().blocked = true;
    }

    pub fn send(&self, origin: &str, data: &str) {
        let message = WindowMessage {
            origin: origin.to_string(),
            data: data.to_string(),
        };
        for listener in &self.script.lock().listeners {
            let _ = listener.unbounded_send(message.clone());
        }
    }

    pub fn close_all(&self) {
        for (_, closed) in &self.script.lock().opened {
            closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.script
            .lock()
            .opened
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn all_closed(&self) -> bool {
        self.script
            .lock()
            .opened
            .iter()
            .all(|(_, closed)| closed.load(Ordering::SeqCst))
    }

    /// Number of listeners whose stream is still alive.
    pub fn listener_count(&self) -> usize {
        self.script
            .lock()
            .listeners
            .iter()
            .filter(|l| !l.is_closed())
            .count()
    }
}

struct ScriptedHandle {
    closed: Arc<AtomicBool>,
}

impl PopupHandle for ScriptedHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PopupOpener for ScriptedPopups {
    fn listen(&self) -> BoxStream<'static, WindowMessage> {
        let (tx, rx) = unbounded();
        self.script.lock().listeners.push(tx);
        rx.boxed()
    }

    fn open(&self, url: &str, _width: u32, _height: u32) -> Option<Box<dyn PopupHandle>> {
        let mut script = self.script.lock();
        if script.blocked {
            return None;
        }
        let closed = Arc::new(AtomicBool::new(false));
        script.opened.push((url.to_string(), closed.clone()));
        Some(Box::new(ScriptedHandle { closed }))
    }
}

/// Opener channel that records posted messages.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    posted: Arc<Mutex<Vec<(String, String)>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posted `(data, target_origin)` pairs.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.posted.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OpenerChannel for RecordingChannel {
    fn post_message(&self, data: &str, target_origin: &str) -> Result<(), AuthError> {
        self.posted
            .lock()
            .push((data.to_string(), target_origin.to_string()));
        Ok(())
    }

    fn close_window(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
