//! Popup-based authorization code flow with PKCE.
//!
//! One login attempt moves through these states:
//!
//! ```text
//! Idle -> AwaitingRedirect -> Exchanging -> Validating -> Complete
//!               \-> Failed (popup blocked or closed, timeout, cancel)
//!                             Exchanging -> Failed (token endpoint error)
//!                                           Validating -> Failed (bad token)
//! ```
//!
//! The opener window runs `AwaitingRedirect`: it stores the PKCE verifier
//! under the random `state`, opens the popup and waits for a cross-window
//! message or for the popup to close. The popup window runs the rest in
//! `handle_redirect_callback` / `complete_in_popup`: it consumes the pending
//! entry for the callback's `state`, exchanges the code, validates the tokens
//! and posts the outcome back to the opener.
//!
//! Messages are only trusted when their origin is the authorization server's
//! origin. Every exit path of an attempt closes the popup, drops the message
//! listener and removes the pending entry.

use crate::client::exchange::{self, TokenResponse};
use crate::client::http_client::HttpTransport;
use crate::client::pkce::{PkcePair, build_authorization_url, generate_state};
use crate::client::runtime::{self, BoxStream, MaybeSend, now_millis, now_secs};
use crate::client::token_storage::KeyValueStore;
use crate::client::validation::TokenValidator;
use crate::config::AuthConfig;
use crate::error::{AuthError, StorageError};
use futures::future::{self, AbortHandle, AbortRegistration, Abortable, Either};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Session-storage key prefix for pending exchanges.
pub const PENDING_KEY_PREFIX: &str = "pkce_";

/// A message received from another window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    /// Origin of the sending window (`scheme://host[:port]`)
    pub origin: String,
    /// Message payload as JSON text
    pub data: String,
}

/// Payload exchanged between the popup and its opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthMessage {
    #[serde(rename = "AUTH_SUCCESS")]
    Success { tokens: TokenResponse },

    #[serde(rename = "AUTH_ERROR")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<AuthError>,
    },
}

impl AuthMessage {
    pub fn into_result(self) -> Result<TokenResponse, AuthError> {
        match self {
            AuthMessage::Success { tokens } => Ok(tokens),
            AuthMessage::Error {
                reason: Some(reason),
                ..
            } => Err(reason),
            AuthMessage::Error { error, reason: None } => Err(AuthError::AuthorizationDenied {
                error,
                description: None,
            }),
        }
    }
}

/// A login popup opened by `PopupOpener`.
pub trait PopupHandle: MaybeSend {
    fn is_closed(&self) -> bool;
    fn close(&self);
}

/// Opens login popups and listens for the messages they send back.
pub trait PopupOpener: MaybeSend {
    /// Starts listening for cross-window messages. Dropping the stream
    /// removes the listener.
    fn listen(&self) -> BoxStream<'static, WindowMessage>;

    /// Opens `url` in a popup. `None` means the browser blocked it.
    fn open(&self, url: &str, width: u32, height: u32) -> Option<Box<dyn PopupHandle>>;
}

/// The popup's view of the window that opened it.
pub trait OpenerChannel: MaybeSend {
    fn post_message(&self, data: &str, target_origin: &str) -> Result<(), AuthError>;
    fn close_window(&self);
}

/// Query parameters of the redirect callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parses a query string, with or without the leading `?`.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::client::flow::CallbackParams;
    /// let params = CallbackParams::from_query("?code=abc&state=xyz");
    /// assert_eq!(params.code.as_deref(), Some("abc"));
    /// assert_eq!(params.state.as_deref(), Some("xyz"));
    /// ```
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = Self::default();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }

        params
    }

    /// Parses the query of a full callback URL.
    pub fn from_url(url: &str) -> Result<Self, AuthError> {
        let url = url::Url::parse(url)
            .map_err(|e| AuthError::Configuration(format!("invalid callback URL: {}", e)))?;
        Ok(Self::from_query(url.query().unwrap_or_default()))
    }
}

/// Verifier stored while a login attempt is outstanding.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExchange {
    pub code_verifier: String,
    /// Unix milliseconds
    pub created_at: i64,
}

impl std::fmt::Debug for PendingExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExchange")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Pending exchanges keyed by `state`, kept in session storage.
#[derive(Clone)]
pub struct PendingExchanges {
    store: Arc<dyn KeyValueStore>,
}

impl PendingExchanges {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(state: &str) -> String {
        format!("{}{}", PENDING_KEY_PREFIX, state)
    }

    pub fn insert(&self, state: &str, code_verifier: &str, now: i64) -> Result<(), StorageError> {
        let entry = PendingExchange {
            code_verifier: code_verifier.to_string(),
            created_at: now,
        };
        let raw =
            serde_json::to_string(&entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.store.set(&Self::key(state), &raw)
    }

    /// Reads and deletes the entry for `state`.
    ///
    /// An unreadable entry is deleted and reported as absent.
    pub fn take(&self, state: &str) -> Result<Option<PendingExchange>, StorageError> {
        let key = Self::key(state);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        self.store.remove(&key)?;

        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Discarding unreadable pending exchange: {}", e);
                Ok(None)
            }
        }
    }

    /// Deletes the entry for `state` without reading it.
    pub fn discard(&self, state: &str) {
        if let Err(e) = self.store.remove(&Self::key(state)) {
            tracing::warn!("Failed to remove pending exchange: {}", e);
        }
    }
}

/// Progress of the current (or last) attempt on this flow instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowState {
    #[default]
    Idle,
    AwaitingRedirect,
    Exchanging,
    Validating,
    Complete,
    Failed,
}

/// Drives login attempts for one engine.
pub struct AuthorizationFlow {
    config: Arc<AuthConfig>,
    transport: Arc<dyn HttpTransport>,
    validator: Arc<TokenValidator>,
    pending: PendingExchanges,
    popups: Option<Arc<dyn PopupOpener>>,
    state: Mutex<FlowState>,
    cancel: Mutex<Option<AbortHandle>>,
}

impl AuthorizationFlow {
    pub fn new(
        config: Arc<AuthConfig>,
        transport: Arc<dyn HttpTransport>,
        validator: Arc<TokenValidator>,
        pending: PendingExchanges,
        popups: Option<Arc<dyn PopupOpener>>,
    ) -> Self {
        Self {
            config,
            transport,
            validator,
            pending,
            popups,
            state: Mutex::new(FlowState::Idle),
            cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() == FlowState::AwaitingRedirect
    }

    fn set_state(&self, state: FlowState) {
        *self.state.lock() = state;
    }

    /// Reserves the flow for a new attempt.
    ///
    /// Fails with `LoginInProgress` while another attempt is waiting for its
    /// popup. Nothing is opened until `LoginAttempt::run` is awaited.
    pub fn begin(&self) -> Result<LoginAttempt<'_>, AuthError> {
        let mut state = self.state.lock();
        if *state == FlowState::AwaitingRedirect {
            tracing::warn!("Login requested while another attempt is in progress");
            return Err(AuthError::LoginInProgress);
        }
        *state = FlowState::AwaitingRedirect;

        let (handle, registration) = AbortHandle::new_pair();
        *self.cancel.lock() = Some(handle);

        Ok(LoginAttempt {
            registration,
            reset: AttemptReset {
                flow: self,
                outcome: FlowState::Failed,
            },
        })
    }

    /// Aborts the outstanding attempt, which then fails with `LoginCancelled`.
    pub fn cancel(&self) {
        if let Some(handle) = self.cancel.lock().take() {
            tracing::trace!("Cancelling login attempt");
            handle.abort();
        }
    }

    async fn await_popup(&self) -> Result<TokenResponse, AuthError> {
        let opener = self
            .popups
            .clone()
            .ok_or_else(|| AuthError::Configuration("no popup opener configured".to_string()))?;
        let expected_origin = self.config.authorization_origin()?;

        let pkce = PkcePair::generate()?;
        let state = generate_state()?;
        self.pending
            .insert(&state, &pkce.code_verifier, now_millis())?;
        let _pending = PendingCleanup {
            pending: &self.pending,
            state: &state,
        };

        let url = build_authorization_url(&self.config, &pkce.code_challenge, &state);
        let mut messages = opener.listen();
        let Some(popup) = opener.open(&url, self.config.popup_width, self.config.popup_height)
        else {
            tracing::warn!("Login popup was blocked");
            return Err(AuthError::PopupBlocked);
        };
        let popup = PopupGuard(popup);
        tracing::trace!("Login popup opened, waiting for callback");

        let poll_interval = self.config.popup_poll_interval();
        let timeout = self.config.login_timeout();
        let mut waited = Duration::ZERO;
        // Re-armed only when it fires; incoming messages never reset it
        let mut tick = Box::pin(runtime::sleep(poll_interval));

        loop {
            let received = match future::select(messages.next(), &mut tick).await {
                Either::Left((message, _)) => Some(message),
                Either::Right(_) => None,
            };

            match received {
                Some(Some(message)) => {
                    if let Some(result) = self.accept_message(&message, &expected_origin) {
                        return result;
                    }
                }
                Some(None) => {
                    tracing::warn!("Message listener ended before the popup reported back");
                    return Err(AuthError::PopupClosedByUser);
                }
                None => {
                    waited += poll_interval;
                    tick = Box::pin(runtime::sleep(poll_interval));
                    if popup.0.is_closed() {
                        // The popup may have posted its result just before closing.
                        while let Some(Some(message)) = messages.next().now_or_never() {
                            if let Some(result) = self.accept_message(&message, &expected_origin) {
                                return result;
                            }
                        }
                        tracing::trace!("Login popup closed by user");
                        return Err(AuthError::PopupClosedByUser);
                    }
                    if timeout.is_some_and(|limit| waited >= limit) {
                        tracing::warn!("Login popup timed out after {:?}", waited);
                        return Err(AuthError::LoginTimedOut);
                    }
                }
            }
        }
    }

    fn accept_message(
        &self,
        message: &WindowMessage,
        expected_origin: &str,
    ) -> Option<Result<TokenResponse, AuthError>> {
        if message.origin != expected_origin {
            tracing::warn!("Ignoring message from untrusted origin {}", message.origin);
            return None;
        }

        match serde_json::from_str::<AuthMessage>(&message.data) {
            Ok(message) => Some(message.into_result()),
            Err(_) => {
                tracing::trace!("Ignoring unrelated window message");
                None
            }
        }
    }

    /// Handles the redirect callback inside the popup.
    ///
    /// Consumes the pending exchange for the callback's `state`, exchanges
    /// the code and validates the tokens. A `state` with no pending entry is
    /// rejected with `InvalidState` before any network call.
    pub async fn handle_redirect_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<TokenResponse, AuthError> {
        let result = self.exchange_callback(params).await;
        match &result {
            Ok(_) => self.set_state(FlowState::Complete),
            Err(e) => {
                tracing::error!("Authorization callback failed: {}", e);
                self.set_state(FlowState::Failed);
            }
        }
        result
    }

    async fn exchange_callback(&self, params: &CallbackParams) -> Result<TokenResponse, AuthError> {
        if let Some(error) = &params.error {
            return Err(AuthError::AuthorizationDenied {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }

        let (Some(code), Some(state)) = (&params.code, &params.state) else {
            return Err(AuthError::MissingParameters);
        };

        let Some(pending) = self.pending.take(state)? else {
            tracing::warn!("Callback state matches no pending login attempt");
            return Err(AuthError::InvalidState);
        };

        self.set_state(FlowState::Exchanging);
        let tokens = exchange::exchange_code(
            self.transport.as_ref(),
            &self.config,
            code,
            &pending.code_verifier,
        )
        .await?;

        self.set_state(FlowState::Validating);
        self.validator
            .validate_response(&tokens, now_secs(), true)
            .await?;

        tracing::trace!("Authorization code exchanged and tokens validated");
        Ok(tokens)
    }

    /// Runs the callback for `query`, reports the outcome to the opener and
    /// closes the popup window.
    pub async fn complete_in_popup(
        &self,
        query: &str,
        channel: &dyn OpenerChannel,
    ) -> Result<TokenResponse, AuthError> {
        let params = CallbackParams::from_query(query);
        let result = self.handle_redirect_callback(&params).await;

        let message = match &result {
            Ok(tokens) => AuthMessage::Success {
                tokens: tokens.clone(),
            },
            Err(e) => AuthMessage::Error {
                error: e.to_string(),
                reason: Some(e.clone()),
            },
        };

        match (
            self.config.authorization_origin(),
            serde_json::to_string(&message),
        ) {
            (Ok(origin), Ok(data)) => {
                if let Err(e) = channel.post_message(&data, &origin) {
                    tracing::error!("Failed to notify opener window: {}", e);
                }
            }
            (Err(e), _) => tracing::error!("Cannot determine opener target origin: {}", e),
            (_, Err(e)) => tracing::error!("Failed to serialize auth message: {}", e),
        }

        channel.close_window();
        result
    }
}

/// A reserved login attempt; see `AuthorizationFlow::begin`.
pub struct LoginAttempt<'a> {
    registration: AbortRegistration,
    reset: AttemptReset<'a>,
}

impl LoginAttempt<'_> {
    /// Opens the popup and waits for the outcome.
    ///
    /// Dropping the future before it resolves abandons the attempt and
    /// releases the popup, listener and pending entry.
    pub async fn run(self) -> Result<TokenResponse, AuthError> {
        let LoginAttempt {
            registration,
            mut reset,
        } = self;

        let result = match Abortable::new(reset.flow.await_popup(), registration).await {
            Ok(result) => result,
            Err(_) => {
                tracing::trace!("Login attempt aborted");
                Err(AuthError::LoginCancelled)
            }
        };

        if result.is_ok() {
            reset.outcome = FlowState::Complete;
        }
        result
    }
}

struct AttemptReset<'a> {
    flow: &'a AuthorizationFlow,
    outcome: FlowState,
}

impl Drop for AttemptReset<'_> {
    fn drop(&mut self) {
        self.flow.set_state(self.outcome);
        self.flow.cancel.lock().take();
    }
}

struct PopupGuard(Box<dyn PopupHandle>);

impl Drop for PopupGuard {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.close();
        }
    }
}

struct PendingCleanup<'a> {
    pending: &'a PendingExchanges,
    state: &'a str,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.pending.discard(self.state);
    }
}
