//! Browser implementations of the storage and popup seams.
//!
//! Only compiled for `wasm32`. Everything here is a thin wrapper over
//! `web-sys`; the protocol logic lives in `flow` and `engine`.

use crate::client::flow::{OpenerChannel, PopupHandle, PopupOpener, WindowMessage};
use crate::client::runtime::BoxStream;
use crate::client::token_storage::KeyValueStore;
use crate::config::{CookieOptions, StorageBackend};
use crate::error::{AuthError, StorageError};
use futures::channel::mpsc::{UnboundedReceiver, unbounded};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{HtmlDocument, MessageEvent, Window};

/// Popup window name, so repeated logins reuse one window.
const POPUP_TARGET: &str = "authPopup";

fn window() -> Result<Window, StorageError> {
    web_sys::window().ok_or_else(|| StorageError::Unavailable("no window".to_string()))
}

fn js_error(value: &JsValue) -> String {
    value
        .as_string()
        .or_else(|| {
            js_sys::JSON::stringify(value)
                .ok()
                .and_then(|s| s.as_string())
        })
        .unwrap_or_else(|| "unknown JavaScript error".to_string())
}

/// Builds the token store selected by `backend`.
pub fn storage_for(backend: &StorageBackend) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    Ok(match backend {
        StorageBackend::LocalStorage => Arc::new(WebStorage::local()?),
        StorageBackend::SessionStorage => Arc::new(WebStorage::session()?),
        StorageBackend::Cookie(options) => Arc::new(CookieStore::new(options.clone())),
        StorageBackend::Memory => Arc::new(crate::client::token_storage::MemoryStore::new()),
    })
}

/// `localStorage` or `sessionStorage`.
pub struct WebStorage {
    storage: web_sys::Storage,
}

impl WebStorage {
    pub fn local() -> Result<Self, StorageError> {
        let storage = window()?
            .local_storage()
            .map_err(|e| StorageError::Unavailable(js_error(&e)))?
            .ok_or_else(|| StorageError::Unavailable("localStorage is disabled".to_string()))?;
        Ok(Self { storage })
    }

    pub fn session() -> Result<Self, StorageError> {
        let storage = window()?
            .session_storage()
            .map_err(|e| StorageError::Unavailable(js_error(&e)))?
            .ok_or_else(|| StorageError::Unavailable("sessionStorage is disabled".to_string()))?;
        Ok(Self { storage })
    }
}

impl KeyValueStore for WebStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get_item(key)
            .map_err(|e| StorageError::Backend(js_error(&e)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set_item(key, value).map_err(|e| {
            let name = js_sys::Reflect::get(&e, &JsValue::from_str("name"))
                .ok()
                .and_then(|n| n.as_string());
            match name.as_deref() {
                Some("QuotaExceededError") => StorageError::QuotaExceeded,
                _ => StorageError::Backend(js_error(&e)),
            }
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.storage
            .remove_item(key)
            .map_err(|e| StorageError::Backend(js_error(&e)))
    }
}

/// `document.cookie` store. Values are percent-encoded.
pub struct CookieStore {
    options: CookieOptions,
}

impl CookieStore {
    pub fn new(options: CookieOptions) -> Self {
        Self { options }
    }

    fn document() -> Result<HtmlDocument, StorageError> {
        window()?
            .document()
            .and_then(|d| d.dyn_into::<HtmlDocument>().ok())
            .ok_or_else(|| StorageError::Unavailable("no HTML document".to_string()))
    }

    fn attributes(&self) -> String {
        let mut attributes = format!("; path={}", self.options.path);
        if let Some(domain) = &self.options.domain {
            attributes.push_str(&format!("; domain={}", domain));
        }
        if self.options.secure {
            attributes.push_str("; secure");
        }
        if let Some(same_site) = self.options.same_site {
            attributes.push_str(&format!("; samesite={}", same_site.as_str()));
        }
        attributes
    }

    fn write(&self, cookie: &str) -> Result<(), StorageError> {
        Self::document()?
            .set_cookie(cookie)
            .map_err(|e| StorageError::Backend(js_error(&e)))
    }
}

impl KeyValueStore for CookieStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let cookies = Self::document()?
            .cookie()
            .map_err(|e| StorageError::Backend(js_error(&e)))?;

        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=')
                && name == key
            {
                let value = urlencoding::decode(value)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let encoded = urlencoding::encode(value);
        // Browsers silently drop cookies over ~4KB
        if encoded.len() + key.len() > 4096 {
            return Err(StorageError::QuotaExceeded);
        }
        self.write(&format!("{}={}{}", key, encoded, self.attributes()))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.write(&format!(
            "{}=; expires=Thu, 01 Jan 1970 00:00:00 GMT{}",
            key,
            self.attributes()
        ))
    }
}

/// Opens login popups with `window.open`.
#[derive(Default)]
pub struct BrowserPopupOpener;

impl BrowserPopupOpener {
    pub fn new() -> Self {
        Self
    }
}

/// Centers a `width` x `height` popup on the screen.
fn popup_features(window: &Window, width: u32, height: u32) -> String {
    let (screen_width, screen_height) = window
        .screen()
        .ok()
        .and_then(|s| Some((s.width().ok()?, s.height().ok()?)))
        .unwrap_or((width as i32, height as i32));
    let left = ((screen_width - width as i32) / 2).max(0);
    let top = ((screen_height - height as i32) / 2).max(0);
    format!(
        "width={},height={},left={},top={},resizable=yes,scrollbars=yes",
        width, height, left, top
    )
}

impl PopupOpener for BrowserPopupOpener {
    fn listen(&self) -> BoxStream<'static, WindowMessage> {
        match MessageListener::attach() {
            Some(listener) => listener.boxed_local(),
            None => {
                tracing::error!("Failed to attach message listener");
                futures::stream::empty().boxed_local()
            }
        }
    }

    fn open(&self, url: &str, width: u32, height: u32) -> Option<Box<dyn PopupHandle>> {
        let window = web_sys::window()?;
        let features = popup_features(&window, width, height);
        match window.open_with_url_and_target_and_features(url, POPUP_TARGET, &features) {
            Ok(Some(popup)) => Some(Box::new(BrowserPopup(popup))),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("window.open failed: {}", js_error(&e));
                None
            }
        }
    }
}

struct BrowserPopup(Window);

impl PopupHandle for BrowserPopup {
    fn is_closed(&self) -> bool {
        self.0.closed().unwrap_or(true)
    }

    fn close(&self) {
        if let Err(e) = self.0.close() {
            tracing::warn!("Failed to close popup: {}", js_error(&e));
        }
    }
}

/// `message` event listener exposed as a stream. Dropping it removes the
/// listener from the window.
struct MessageListener {
    window: Window,
    callback: Closure<dyn FnMut(MessageEvent)>,
    messages: UnboundedReceiver<WindowMessage>,
}

impl MessageListener {
    fn attach() -> Option<Self> {
        let window = web_sys::window()?;
        let (tx, messages) = unbounded();

        let callback = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let data = event.data();
            let data = data
                .as_string()
                .or_else(|| js_sys::JSON::stringify(&data).ok().and_then(|s| s.as_string()));
            if let Some(data) = data {
                let _ = tx.unbounded_send(WindowMessage {
                    origin: event.origin(),
                    data,
                });
            }
        });

        window
            .add_event_listener_with_callback("message", callback.as_ref().unchecked_ref())
            .ok()?;

        Some(Self {
            window,
            callback,
            messages,
        })
    }
}

impl Stream for MessageListener {
    type Item = WindowMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_next_unpin(cx)
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        let _ = self
            .window
            .remove_event_listener_with_callback("message", self.callback.as_ref().unchecked_ref());
    }
}

/// The popup's handle on `window.opener`.
pub struct BrowserOpenerChannel {
    window: Window,
    opener: Window,
}

impl BrowserOpenerChannel {
    pub fn new() -> Result<Self, AuthError> {
        let window = window()?;
        let opener = window
            .opener()
            .ok()
            .and_then(|o| o.dyn_into::<Window>().ok())
            .ok_or_else(|| AuthError::Configuration("page has no opener window".to_string()))?;
        Ok(Self { window, opener })
    }
}

impl OpenerChannel for BrowserOpenerChannel {
    fn post_message(&self, data: &str, target_origin: &str) -> Result<(), AuthError> {
        self.opener
            .post_message(&JsValue::from_str(data), target_origin)
            .map_err(|e| AuthError::Network(format!("postMessage failed: {}", js_error(&e))))
    }

    fn close_window(&self) {
        if let Err(e) = self.window.close() {
            tracing::warn!("Failed to close popup window: {}", js_error(&e));
        }
    }
}

/// Returns `window.location.search`.
pub fn current_query() -> Result<String, AuthError> {
    window()?
        .location()
        .search()
        .map_err(|e| AuthError::Configuration(format!("cannot read location: {}", js_error(&e))))
}
