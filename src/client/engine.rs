//! Authentication state engine.
//!
//! `AuthEngine` owns the current token record and the published `AuthState`
//! and is the only component that changes either. It composes the token
//! store, the authorization flow, the validator and the refresh scheduler:
//!
//! ```text
//! login() -> flow -> tokens -> store.save -> state -> scheduler.arm -> notify
//! ```
//!
//! ## Ordering
//!
//! - Tokens are persisted before subscribers are notified, so a subscriber
//!   that sees `is_authenticated` can rely on the record being durable.
//! - At most one refresh is in flight; concurrent callers share its outcome.
//! - `logout` bumps a generation counter. Work started before the logout
//!   (a refresh, a login) cannot commit tokens afterwards.
//!
//! The engine is cheap to clone; clones share all state.

use crate::client::exchange::{self, TokenResponse};
use crate::client::flow::{
    AuthorizationFlow, CallbackParams, OpenerChannel, PendingExchanges, PopupOpener,
};
use crate::client::http_client::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::client::jwt;
use crate::client::pkce::generate_csrf_token;
use crate::client::runtime::{self, BoxFuture, MaybeSend, now_millis, now_secs};
use crate::client::scheduler::RefreshScheduler;
use crate::client::token_storage::{KeyValueStore, TokenRecord, TokenStore};
use crate::client::validation::{SignatureVerifier, TokenValidator};
use crate::config::{AuthConfig, StorageBackend};
use crate::error::{AuthError, ValidationError};
use crate::guard::{AccessDenied, AccessPolicy};
use crate::user::User;
use futures::FutureExt;
use futures::future::Shared;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Session-storage key holding the most recent anti-CSRF token.
pub const CSRF_STORAGE_KEY: &str = "csrf_token";

/// The externally observable authentication state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub loading: bool,
}

#[cfg(not(target_arch = "wasm32"))]
type Listener = Arc<dyn Fn(&AuthState) + Send + Sync>;
#[cfg(target_arch = "wasm32")]
type Listener = Arc<dyn Fn(&AuthState)>;

type Registry = Mutex<Vec<(u64, Listener)>>;

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenRecord, AuthError>>>;

/// Handle returned by `AuthEngine::on_state_changed`.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Removes the listener. Safe to call more than once, and from inside
    /// the listener itself.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct EngineState {
    tokens: Option<TokenRecord>,
    user: Option<User>,
    loading: bool,
    generation: u64,
    refresh_in_flight: Option<(u64, SharedRefresh)>,
}

impl EngineState {
    fn snapshot(&self) -> AuthState {
        AuthState {
            is_authenticated: self.tokens.is_some() && self.user.is_some(),
            user: self.user.clone(),
            loading: self.loading,
        }
    }
}

struct EngineInner {
    config: Arc<AuthConfig>,
    store: TokenStore,
    session: Arc<dyn KeyValueStore>,
    transport: Arc<dyn HttpTransport>,
    validator: Arc<TokenValidator>,
    flow: AuthorizationFlow,
    scheduler: RefreshScheduler,
    state: Mutex<EngineState>,
    listeners: Arc<Registry>,
    next_listener_id: AtomicU64,
    next_refresh_id: AtomicU64,
}

/// Builds an `AuthEngine`, filling unset collaborators with platform defaults.
///
/// Defaults:
/// - token storage: the browser store named by `config.storage`; on native
///   targets only `StorageBackend::Memory` is available
/// - session storage: `sessionStorage` in the browser, memory elsewhere
/// - transport: `ReqwestTransport`
/// - popups: browser windows; none on native targets (login then fails with
///   a configuration error)
/// - signature verifier: `JwtSignatureVerifier` on native targets; none in
///   the browser
pub struct AuthEngineBuilder {
    config: AuthConfig,
    token_backend: Option<Arc<dyn KeyValueStore>>,
    session_backend: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    popups: Option<Arc<dyn PopupOpener>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl AuthEngineBuilder {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            token_backend: None,
            session_backend: None,
            transport: None,
            popups: None,
            verifier: None,
        }
    }

    pub fn token_backend(mut self, backend: Arc<dyn KeyValueStore>) -> Self {
        self.token_backend = Some(backend);
        self
    }

    pub fn session_backend(mut self, backend: Arc<dyn KeyValueStore>) -> Self {
        self.session_backend = Some(backend);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn popups(mut self, popups: Arc<dyn PopupOpener>) -> Self {
        self.popups = Some(popups);
        self
    }

    pub fn signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn build(self) -> Result<AuthEngine, AuthError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let token_backend = match self.token_backend {
            Some(backend) => backend,
            None => default_token_backend(&config.storage)?,
        };
        let session = match self.session_backend {
            Some(backend) => backend,
            None => default_session_backend()?,
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        let popups = self.popups.or_else(default_popups);
        let verifier = self.verifier.or_else(default_verifier);

        let validator = Arc::new(TokenValidator::from_config(
            &config,
            transport.clone(),
            verifier,
        )?);
        let flow = AuthorizationFlow::new(
            config.clone(),
            transport.clone(),
            validator.clone(),
            PendingExchanges::new(session.clone()),
            popups,
        );

        tracing::trace!(
            "Auth engine built for client '{}' at {}",
            config.client_id,
            config.issuer()
        );

        Ok(AuthEngine {
            inner: Arc::new(EngineInner {
                store: TokenStore::new(token_backend, config.storage_key.clone()),
                config,
                session,
                transport,
                validator,
                flow,
                scheduler: RefreshScheduler::new(),
                state: Mutex::new(EngineState::default()),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_listener_id: AtomicU64::new(0),
                next_refresh_id: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn default_token_backend(storage: &StorageBackend) -> Result<Arc<dyn KeyValueStore>, AuthError> {
    use crate::client::token_storage::MemoryStore;
    use crate::error::StorageError;

    match storage {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        other => Err(StorageError::Unavailable(format!(
            "{:?} is only available in the browser; pass a token backend",
            other
        ))
        .into()),
    }
}

#[cfg(target_arch = "wasm32")]
fn default_token_backend(storage: &StorageBackend) -> Result<Arc<dyn KeyValueStore>, AuthError> {
    Ok(crate::client::browser::storage_for(storage)?)
}

#[cfg(not(target_arch = "wasm32"))]
fn default_session_backend() -> Result<Arc<dyn KeyValueStore>, AuthError> {
    Ok(Arc::new(crate::client::token_storage::MemoryStore::new()))
}

#[cfg(target_arch = "wasm32")]
fn default_session_backend() -> Result<Arc<dyn KeyValueStore>, AuthError> {
    Ok(Arc::new(crate::client::browser::WebStorage::session()?))
}

#[cfg(not(target_arch = "wasm32"))]
fn default_popups() -> Option<Arc<dyn PopupOpener>> {
    None
}

#[cfg(target_arch = "wasm32")]
fn default_popups() -> Option<Arc<dyn PopupOpener>> {
    Some(Arc::new(crate::client::browser::BrowserPopupOpener::new()))
}

#[cfg(not(target_arch = "wasm32"))]
fn default_verifier() -> Option<Arc<dyn SignatureVerifier>> {
    Some(Arc::new(crate::client::validation::JwtSignatureVerifier))
}

#[cfg(target_arch = "wasm32")]
fn default_verifier() -> Option<Arc<dyn SignatureVerifier>> {
    None
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Commit {
    /// Login or externally adopted tokens
    NewSession,
    /// Refresh of the current session
    SameSession,
}

/// Derives the user from the ID token when present, else the access token.
fn derive_user(record: &TokenRecord) -> Result<User, ValidationError> {
    let token = record.id_token.as_deref().unwrap_or(&record.access_token);
    let claims = jwt::decode_claims(token)?;
    User::from_claims(&claims)
}

/// The authentication engine. See the module docs.
#[derive(Clone)]
pub struct AuthEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthEngine")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AuthEngine {
    /// Builds an engine with platform defaults for every collaborator.
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        AuthEngineBuilder::new(config).build()
    }

    pub fn builder(config: AuthConfig) -> AuthEngineBuilder {
        AuthEngineBuilder::new(config)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Restores the session from storage.
    ///
    /// - nothing stored, or an unreadable record: unauthenticated
    /// - expired with a refresh token: exactly one refresh (failure clears)
    /// - expired without a refresh token: cleared, no network call
    /// - otherwise: user derived from the stored tokens, refresh armed
    pub async fn initialize(&self) -> AuthState {
        self.set_loading(true);
        let generation = self.inner.state.lock().generation;

        let loaded = match self.inner.store.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("Discarding stored tokens: {}", e);
                self.reset_to_unauthenticated();
                None
            }
        };

        match loaded {
            None => tracing::trace!("No stored session"),
            Some(record) if record.is_expired_by_claims_at(now_millis()) => {
                if record.refresh_token.is_some() {
                    tracing::trace!("Stored access token expired, refreshing");
                    self.inner.state.lock().tokens = Some(record);
                    if let Err(e) = self.refresh().await {
                        tracing::warn!("Cold-start refresh failed: {}", e);
                    }
                } else {
                    tracing::trace!("Stored access token expired and cannot be refreshed");
                    self.reset_to_unauthenticated();
                }
            }
            Some(record) => match derive_user(&record) {
                Ok(user) => {
                    if let Err(e) = self.commit(record, user, generation, Commit::SameSession) {
                        tracing::warn!("Failed to restore session: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Stored tokens carry no usable claims: {}", e);
                    self.reset_to_unauthenticated();
                }
            },
        }

        self.set_loading(false);
        self.state()
    }

    /// Runs the popup login.
    ///
    /// Only one login may be in flight; a second call fails with
    /// `LoginInProgress`. On failure the previous tokens are kept.
    pub async fn login(&self) -> Result<User, AuthError> {
        let attempt = self.inner.flow.begin()?;
        let generation = self.inner.state.lock().generation;

        self.set_loading(true);
        let _loading = LoadingReset(self);

        let tokens = attempt.run().await?;
        let user = self.adopt(tokens, generation)?;
        tracing::trace!("Logged in as {}", user.id);
        Ok(user)
    }

    fn adopt(&self, tokens: TokenResponse, generation: u64) -> Result<User, AuthError> {
        let previous = self.tokens();
        let record = tokens.into_record(now_millis(), previous.as_ref());
        let user = derive_user(&record)?;
        if !self.commit(record, user.clone(), generation, Commit::NewSession)? {
            return Err(AuthError::LoginCancelled);
        }
        Ok(user)
    }

    /// Signs out locally, then revokes the tokens at the server.
    ///
    /// Always succeeds locally; revocation failures are only logged. An
    /// in-flight login is cancelled and an in-flight refresh cannot commit.
    pub async fn logout(&self) {
        self.inner.flow.cancel();

        let previous = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.refresh_in_flight = None;
            state.user = None;
            state.loading = false;
            state.tokens.take()
        };

        self.inner.scheduler.disarm();
        if let Err(e) = self.inner.store.clear() {
            tracing::warn!("Failed to clear stored tokens: {}", e);
        }
        if let Err(e) = self.inner.session.remove(CSRF_STORAGE_KEY) {
            tracing::warn!("Failed to clear CSRF token: {}", e);
        }
        self.notify();
        tracing::trace!("Logged out");

        if let Some(record) = previous {
            self.revoke(&record).await;
        }
    }

    async fn revoke(&self, record: &TokenRecord) {
        let (token, hint) = match &record.refresh_token {
            Some(refresh_token) => (refresh_token.as_str(), "refresh_token"),
            None => (record.access_token.as_str(), "access_token"),
        };

        if let Err(e) =
            exchange::revoke_token(self.inner.transport.as_ref(), &self.inner.config, token, hint)
                .await
        {
            tracing::warn!("Token revocation failed: {}", e);
        }
    }

    /// Exchanges the refresh token for a new token set.
    ///
    /// Concurrent calls share one exchange. Any failure clears the session.
    pub async fn refresh(&self) -> Result<TokenRecord, AuthError> {
        let shared = {
            let mut state = self.inner.state.lock();
            match &state.refresh_in_flight {
                Some((_, shared)) => {
                    tracing::trace!("Joining in-flight refresh");
                    shared.clone()
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let engine = self.clone();
                    let exchange: BoxFuture<'static, _> = Box::pin(async move {
                        let result = engine.perform_refresh().await;
                        engine.finish_refresh(id);
                        result
                    });
                    let shared = exchange.shared();
                    state.refresh_in_flight = Some((id, shared.clone()));
                    shared
                }
            }
        };
        shared.await
    }

    fn finish_refresh(&self, id: u64) {
        let mut state = self.inner.state.lock();
        if state
            .refresh_in_flight
            .as_ref()
            .is_some_and(|(current, _)| *current == id)
        {
            state.refresh_in_flight = None;
        }
    }

    async fn perform_refresh(&self) -> Result<TokenRecord, AuthError> {
        let (generation, previous) = {
            let state = self.inner.state.lock();
            (state.generation, state.tokens.clone())
        };

        let result = self.exchange_refresh(previous, generation).await;
        if let Err(e) = &result {
            tracing::error!("Token refresh failed: {}", e);
            if self.inner.state.lock().generation == generation {
                self.reset_to_unauthenticated();
            }
        }
        result
    }

    async fn exchange_refresh(
        &self,
        previous: Option<TokenRecord>,
        generation: u64,
    ) -> Result<TokenRecord, AuthError> {
        let Some(refresh_token) = previous.as_ref().and_then(|p| p.refresh_token.clone()) else {
            return Err(AuthError::NoRefreshToken);
        };

        let response = exchange::refresh_tokens(
            self.inner.transport.as_ref(),
            &self.inner.config,
            &refresh_token,
        )
        .await?;
        self.inner
            .validator
            .validate_response(&response, now_secs(), false)
            .await?;

        let record = response.into_record(now_millis(), previous.as_ref());
        let user = derive_user(&record)?;
        if !self.commit(record.clone(), user, generation, Commit::SameSession)? {
            return Err(AuthError::SessionSuperseded);
        }
        tracing::trace!("Tokens refreshed");
        Ok(record)
    }

    /// Adopts tokens obtained outside the popup flow.
    pub fn set_tokens(&self, record: TokenRecord) -> Result<User, AuthError> {
        let generation = self.inner.state.lock().generation;
        let user = derive_user(&record)?;
        self.commit(record, user.clone(), generation, Commit::NewSession)?;
        Ok(user)
    }

    /// Persists `record` and publishes it.
    ///
    /// Returns `Ok(false)` when a logout or another login happened since
    /// `generation` was read; nothing is changed then. A failed save leaves
    /// the engine unauthenticated.
    fn commit(
        &self,
        record: TokenRecord,
        user: User,
        generation: u64,
        kind: Commit,
    ) -> Result<bool, AuthError> {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                tracing::trace!("Discarding tokens from a superseded session");
                return Ok(false);
            }

            // A new session orphans any refresh still running for the old one
            if kind == Commit::NewSession {
                state.generation += 1;
                state.refresh_in_flight = None;
            }

            if let Err(e) = self.inner.store.save(&record) {
                tracing::error!("Failed to persist tokens: {}", e);
                drop(state);
                self.reset_to_unauthenticated();
                return Err(e.into());
            }

            state.tokens = Some(record.clone());
            state.user = Some(user);
            state.loading = false;
        }

        if self.inner.config.auto_refresh {
            self.arm_refresh(&record);
        }
        self.notify();
        Ok(true)
    }

    fn arm_refresh(&self, record: &TokenRecord) {
        let engine = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .arm(record, self.inner.config.refresh_threshold(), move || {
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                let engine = AuthEngine { inner };
                runtime::spawn(async move {
                    if let Err(e) = engine.refresh().await {
                        tracing::warn!("Scheduled refresh failed: {}", e);
                    }
                });
            });
    }

    fn reset_to_unauthenticated(&self) {
        {
            let mut state = self.inner.state.lock();
            state.tokens = None;
            state.user = None;
            state.loading = false;
        }
        self.inner.scheduler.disarm();
        if let Err(e) = self.inner.store.clear() {
            tracing::warn!("Failed to clear stored tokens: {}", e);
        }
        self.notify();
    }

    fn set_loading(&self, loading: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.loading, loading) != loading
        };
        if changed {
            self.notify();
        }
    }

    /// Returns a usable access token, refreshing or logging in as needed.
    async fn ensure_access_token(&self) -> Result<String, AuthError> {
        let record = match self.tokens() {
            None => {
                tracing::trace!("No access token, starting login");
                self.login().await?;
                self.tokens()
            }
            Some(record) if record.is_expired_at(now_millis()) => match self.refresh().await {
                Ok(record) => Some(record),
                Err(AuthError::SessionSuperseded) if self.tokens().is_some() => self.tokens(),
                Err(e) => {
                    tracing::warn!("Refresh failed ({}), starting login", e);
                    self.login().await?;
                    self.tokens()
                }
            },
            Some(record) => Some(record),
        };

        record
            .map(|r| r.access_token)
            .ok_or_else(|| ValidationError::MissingToken("access_token".to_string()).into())
    }

    /// Attaches credentials to `request`.
    ///
    /// Adds the access token header and, for POST/PUT/PATCH/DELETE, a fresh
    /// anti-CSRF token. Logs in or refreshes first when needed.
    pub async fn with_auth(&self, request: HttpRequest) -> Result<HttpRequest, AuthError> {
        let token = self.ensure_access_token().await?;
        let config = &self.inner.config;

        let value = if config.token_prefix.is_empty() {
            token
        } else {
            format!("{} {}", config.token_prefix, token)
        };
        let mut request = request.with_header(&config.auth_header, value);

        if request.is_state_mutating() {
            let csrf = generate_csrf_token()?;
            if let Err(e) = self.inner.session.set(CSRF_STORAGE_KEY, &csrf) {
                tracing::warn!("Failed to store CSRF token: {}", e);
            }
            request = request.with_header(&config.csrf_header, csrf);
        }

        Ok(request)
    }

    /// `with_auth` followed by sending the request.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        let request = self.with_auth(request).await?;
        self.inner.transport.execute(request).await
    }

    /// Registers `callback` for state changes.
    ///
    /// The callback runs once immediately with the current state, then after
    /// every transition. Listeners are called outside the engine's locks, so
    /// they may call back into the engine or unsubscribe.
    pub fn on_state_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthState) + MaybeSend + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(callback);
        self.inner.listeners.lock().push((id, listener.clone()));

        listener(&self.state());
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }

    fn notify(&self) {
        let state = self.state();
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(&state);
        }
    }

    pub fn state(&self) -> AuthState {
        self.inner.state.lock().snapshot()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.state.lock().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    pub fn tokens(&self) -> Option<TokenRecord> {
        self.inner.state.lock().tokens.clone()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.user().is_some_and(|u| u.has_role(role))
    }

    pub fn has_any_role<I, S>(&self, roles: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.user().is_some_and(|u| u.has_any_role(roles))
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.user().is_some_and(|u| u.has_permission(permission))
    }

    pub fn has_any_permission<I, S>(&self, permissions: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.user().is_some_and(|u| u.has_any_permission(permissions))
    }

    pub fn authorize(&self, policy: &AccessPolicy) -> Result<(), AccessDenied> {
        policy.check(&self.state())
    }

    /// Popup side: handles the redirect callback. See `AuthorizationFlow`.
    pub async fn handle_redirect_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<TokenResponse, AuthError> {
        self.inner.flow.handle_redirect_callback(params).await
    }

    /// Popup side: handles the callback and reports back to the opener.
    pub async fn complete_in_popup(
        &self,
        query: &str,
        opener: &dyn OpenerChannel,
    ) -> Result<TokenResponse, AuthError> {
        self.inner.flow.complete_in_popup(query, opener).await
    }

    /// Popup side: completes the login from the current page's location.
    #[cfg(target_arch = "wasm32")]
    pub async fn complete_popup_login(&self) -> Result<TokenResponse, AuthError> {
        let query = crate::client::browser::current_query()?;
        let opener = crate::client::browser::BrowserOpenerChannel::new()?;
        self.complete_in_popup(&query, &opener).await
    }
}

/// Clears `loading` when a login ends, however it ends.
struct LoadingReset<'a>(&'a AuthEngine);

impl Drop for LoadingReset<'_> {
    fn drop(&mut self) {
        self.0.set_loading(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::flow::AuthMessage;
    use crate::client::scheduler::refresh_delay;
    use crate::client::testing::{
        FailingStore, RecordingTransport, ScriptedPopups, make_jwt, test_config,
    };
    use crate::client::token_storage::MemoryStore;
    use crate::config::DEFAULT_STORAGE_KEY;
    use crate::error::StorageError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ORIGIN: &str = "https://id.example.com";

    struct Fixture {
        engine: AuthEngine,
        transport: RecordingTransport,
        popups: ScriptedPopups,
        tokens: MemoryStore,
        session: MemoryStore,
    }

    fn fixture_with(config: AuthConfig, transport: RecordingTransport) -> Fixture {
        let popups = ScriptedPopups::new();
        let tokens = MemoryStore::new();
        let session = MemoryStore::new();
        let engine = AuthEngine::builder(config)
            .token_backend(Arc::new(tokens.clone()))
            .session_backend(Arc::new(session.clone()))
            .transport(Arc::new(transport.clone()))
            .popups(Arc::new(popups.clone()))
            .build()
            .unwrap();
        Fixture {
            engine,
            transport,
            popups,
            tokens,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config(), RecordingTransport::new())
    }

    fn access_token(sub: &str) -> String {
        make_jwt(
            None,
            json!({ "sub": sub, "exp": now_secs() + 3600, "roles": ["admin", "editor"] }),
        )
    }

    fn live_record(sub: &str) -> TokenRecord {
        TokenRecord::new(access_token(sub))
            .with_refresh_token("refresh-1")
            .expiring_in(3600, now_millis())
    }

    fn expired_record() -> TokenRecord {
        TokenRecord::new(access_token("user-1"))
            .with_refresh_token("refresh-1")
            .with_expires_at(now_millis() - 1_000)
    }

    fn token_response(sub: &str) -> HttpResponse {
        HttpResponse::new(
            200,
            json!({
                "access_token": access_token(sub),
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })
            .to_string(),
        )
    }

    fn store(backend: &MemoryStore, record: &TokenRecord) {
        backend
            .set(DEFAULT_STORAGE_KEY, &serde_json::to_string(record).unwrap())
            .unwrap();
    }

    fn stored(backend: &MemoryStore) -> Option<TokenRecord> {
        backend
            .get(DEFAULT_STORAGE_KEY)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    /// Answers the next login popup with `tokens` once it is open.
    fn answer_popup(popups: &ScriptedPopups, tokens: serde_json::Value) {
        let popups = popups.clone();
        tokio::spawn(async move {
            while popups.opened_urls().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let message = json!({ "type": "AUTH_SUCCESS", "tokens": tokens });
            popups.send(ORIGIN, &message.to_string());
        });
    }

    fn close_popup(popups: &ScriptedPopups) {
        let popups = popups.clone();
        tokio::spawn(async move {
            while popups.opened_urls().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            popups.close_all();
        });
    }

    fn record_states(engine: &AuthEngine) -> Arc<Mutex<Vec<AuthState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.on_state_changed(move |state| sink.lock().push(state.clone()));
        seen
    }

    #[tokio::test]
    async fn test_cold_start_refreshes_expired_tokens_once() {
        let f = fixture();
        store(&f.tokens, &expired_record());
        f.transport.respond(token_response("user-1"));

        let state = f.engine.initialize().await;

        assert!(state.is_authenticated);
        assert!(!state.loading);
        assert_eq!(state.user.unwrap().id, "user-1");
        assert_eq!(f.transport.requests_to(&f.engine.config().token_url()), 1);
        assert!(f.popups.opened_urls().is_empty());
        assert_eq!(
            stored(&f.tokens).unwrap().refresh_token.as_deref(),
            Some("refresh-2")
        );
    }

    #[tokio::test]
    async fn test_cold_start_without_refresh_token_clears() {
        let f = fixture();
        let record = TokenRecord::new(access_token("user-1")).with_expires_at(now_millis() - 1);
        store(&f.tokens, &record);

        let state = f.engine.initialize().await;

        assert_eq!(state, AuthState::default());
        assert!(f.transport.requests().is_empty());
        assert!(f.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_expired_by_claims() {
        let f = fixture();
        let stale = make_jwt(None, json!({ "sub": "u", "exp": now_secs() - 60 }));
        store(&f.tokens, &TokenRecord::new(stale));

        assert!(!f.engine.initialize().await.is_authenticated);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_restores_live_session() {
        let f = fixture();
        let id_token = make_jwt(None, json!({ "sub": "id-user", "email": "a@example.com" }));
        store(&f.tokens, &live_record("access-user").with_id_token(id_token));
        let seen = record_states(&f.engine);

        let state = f.engine.initialize().await;

        let user = state.user.unwrap();
        assert_eq!(user.id, "id-user");
        assert_eq!(user.email(), Some("a@example.com"));
        assert!(f.engine.inner.scheduler.is_armed());
        assert!(f.transport.requests().is_empty());

        let seen = seen.lock();
        assert!(seen[1].loading);
        let last = seen.last().unwrap();
        assert!(last.is_authenticated && !last.loading);
    }

    #[tokio::test]
    async fn test_cold_start_with_corrupt_record() {
        let f = fixture();
        f.tokens.set(DEFAULT_STORAGE_KEY, "{not json").unwrap();

        let state = f.engine.initialize().await;
        assert!(!state.is_authenticated);
        assert!(f.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_shares_one_exchange() {
        let transport = RecordingTransport::new().with_delay(Duration::from_millis(100));
        transport.respond(token_response("user-1"));
        let f = fixture_with(test_config(), transport);
        f.engine.set_tokens(live_record("user-1")).unwrap();

        let (a, b) = tokio::join!(f.engine.refresh(), f.engine.refresh());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.transport.requests_to(&f.engine.config().token_url()), 1);
        assert!(f.engine.inner.state.lock().refresh_in_flight.is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let f = fixture();
        f.engine
            .set_tokens(TokenRecord::new(access_token("user-1")))
            .unwrap();

        assert_eq!(f.engine.refresh().await, Err(AuthError::NoRefreshToken));
        assert!(!f.engine.is_authenticated());
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_unrotated_refresh_token() {
        let f = fixture();
        f.engine.set_tokens(live_record("user-1")).unwrap();
        f.transport.respond(HttpResponse::new(
            200,
            json!({ "access_token": access_token("user-1"), "expires_in": 60 }).to_string(),
        ));

        let record = f.engine.refresh().await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(stored(&f.tokens), Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_arms_refresh_before_expiry() {
        let f = fixture();
        let seen = record_states(&f.engine);
        let id_token = make_jwt(
            None,
            json!({
                "sub": "user-1",
                "iss": ORIGIN,
                "aud": "spa-client",
                "exp": now_secs() + 3600,
                "roles": ["admin"]
            }),
        );
        answer_popup(
            &f.popups,
            json!({
                "access_token": access_token("user-1"),
                "id_token": id_token,
                "refresh_token": "refresh-1",
                "expires_in": 3600
            }),
        );

        let user = f.engine.login().await.unwrap();
        assert_eq!(user.id, "user-1");
        assert!(f.engine.has_role("admin"));
        assert!(!f.engine.has_any_role(["owner"]));

        let record = f.engine.tokens().unwrap();
        assert_eq!(stored(&f.tokens), Some(record.clone()));
        assert!(f.engine.inner.scheduler.is_armed());

        let threshold = f.engine.config().refresh_threshold();
        let delay = refresh_delay(&record, threshold, now_millis()).unwrap();
        let expected = 3_600_000 - threshold.as_millis() as i64;
        assert!((delay.as_millis() as i64 - expected).abs() < 5_000);

        let seen = seen.lock();
        assert!(seen.iter().any(|s| s.loading));
        assert!(seen.last().unwrap().is_authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_keeps_previous_session() {
        let f = fixture();
        f.engine.set_tokens(live_record("user-1")).unwrap();
        close_popup(&f.popups);

        let result = f.engine.login().await;

        assert_eq!(result, Err(AuthError::PopupClosedByUser));
        let state = f.engine.state();
        assert!(state.is_authenticated);
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_login_is_rejected() {
        let f = fixture();
        close_popup(&f.popups);

        let (first, second) = tokio::join!(f.engine.login(), f.engine.login());
        let outcomes = [first, second];
        assert!(outcomes.contains(&Err(AuthError::LoginInProgress)));
        assert!(outcomes.contains(&Err(AuthError::PopupClosedByUser)));
        assert_eq!(f.popups.opened_urls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_clears_then_with_auth_logs_in() {
        let f = fixture();
        f.engine.set_tokens(expired_record()).unwrap();
        f.transport.respond(HttpResponse::new(
            400,
            r#"{"error":"invalid_grant"}"#,
        ));

        assert!(matches!(
            f.engine.refresh().await,
            Err(AuthError::TokenEndpoint { status: 400, .. })
        ));
        assert!(!f.engine.is_authenticated());
        assert!(f.engine.tokens().is_none());
        assert!(f.tokens.is_empty());
        assert!(!f.engine.inner.scheduler.is_armed());

        let fresh = access_token("user-1");
        answer_popup(
            &f.popups,
            json!({ "access_token": fresh, "expires_in": 3600 }),
        );
        let request = f
            .engine
            .with_auth(HttpRequest::get("https://api.example.com/me"))
            .await
            .unwrap();

        assert_eq!(f.popups.opened_urls().len(), 1);
        assert_eq!(
            request.header("Authorization"),
            Some(format!("Bearer {}", fresh).as_str())
        );
    }

    #[tokio::test]
    async fn test_with_auth_refreshes_expired_token() {
        let f = fixture();
        f.engine.set_tokens(expired_record()).unwrap();
        f.transport.respond(token_response("user-1"));

        let request = f
            .engine
            .with_auth(HttpRequest::get("https://api.example.com/me"))
            .await
            .unwrap();

        let current = f.engine.access_token().unwrap();
        assert_eq!(
            request.header("Authorization"),
            Some(format!("Bearer {}", current).as_str())
        );
        assert_eq!(f.transport.requests_to(&f.engine.config().token_url()), 1);
        assert!(f.popups.opened_urls().is_empty());
    }

    #[tokio::test]
    async fn test_with_auth_adds_csrf_to_mutating_requests() {
        let mut config = test_config();
        config.token_prefix = String::new();
        config.auth_header = "X-Access-Token".to_string();
        let f = fixture_with(config, RecordingTransport::new());
        let record = live_record("user-1");
        f.engine.set_tokens(record.clone()).unwrap();

        let get = f
            .engine
            .with_auth(HttpRequest::get("https://api.example.com/items"))
            .await
            .unwrap();
        assert_eq!(get.header("X-Access-Token"), Some(record.access_token.as_str()));
        assert!(get.header("X-CSRF-TOKEN").is_none());

        let post = f
            .engine
            .with_auth(HttpRequest::post("https://api.example.com/items"))
            .await
            .unwrap();
        let csrf = post.header("X-CSRF-TOKEN").unwrap();
        assert_eq!(csrf.len(), 64);
        assert_eq!(
            f.session.get(CSRF_STORAGE_KEY).unwrap().as_deref(),
            Some(csrf)
        );
    }

    #[tokio::test]
    async fn test_fetch_sends_authorized_request() {
        let f = fixture();
        f.engine.set_tokens(live_record("user-1")).unwrap();
        f.transport.respond(HttpResponse::new(200, "{}"));

        let response = f
            .engine
            .fetch(HttpRequest::get("https://api.example.com/me"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(f.transport.requests()[0].header("Authorization").is_some());
    }

    #[tokio::test]
    async fn test_logout_revokes_refresh_token() {
        let f = fixture();
        f.engine.set_tokens(live_record("user-1")).unwrap();
        f.session.set(CSRF_STORAGE_KEY, "csrf").unwrap();
        f.transport.respond(HttpResponse::new(200, ""));

        f.engine.logout().await;

        assert_eq!(f.engine.state(), AuthState::default());
        assert!(f.tokens.is_empty());
        assert!(f.session.get(CSRF_STORAGE_KEY).unwrap().is_none());
        assert!(!f.engine.inner.scheduler.is_armed());

        let revocation = &f.transport.requests()[0];
        assert_eq!(revocation.url, f.engine.config().revocation_url());
        assert_eq!(revocation.form_value("token"), Some("refresh-1"));
        assert_eq!(revocation.form_value("token_type_hint"), Some("refresh_token"));
    }

    #[tokio::test]
    async fn test_logout_survives_revocation_failure() {
        let f = fixture();
        f.engine
            .set_tokens(TokenRecord::new(access_token("user-1")))
            .unwrap();

        // No scripted response: the revocation call fails
        f.engine.logout().await;

        assert!(!f.engine.is_authenticated());
        assert!(f.tokens.is_empty());
        assert_eq!(
            f.transport.requests()[0].form_value("token_type_hint"),
            Some("access_token")
        );
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_result() {
        let transport = RecordingTransport::new().with_delay(Duration::from_millis(100));
        transport.respond(token_response("user-1"));
        let f = fixture_with(test_config(), transport);
        f.engine.set_tokens(live_record("user-1")).unwrap();

        let engine = f.engine.clone();
        let (refreshed, ()) = tokio::join!(f.engine.refresh(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.logout().await;
        });

        assert_eq!(refreshed, Err(AuthError::SessionSuperseded));
        assert!(!f.engine.is_authenticated());
        assert!(f.tokens.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_refresh_keeps_new_session() {
        let transport = RecordingTransport::new().with_delay(Duration::from_secs(2));
        transport.respond(token_response("user-1"));
        let f = fixture_with(test_config(), transport);
        f.engine.set_tokens(live_record("user-1")).unwrap();
        answer_popup(
            &f.popups,
            json!({
                "access_token": access_token("user-2"),
                "id_token": access_token("user-2"),
                "refresh_token": "refresh-user-2",
                "expires_in": 3600
            }),
        );

        let (refreshed, logged_in) = tokio::join!(f.engine.refresh(), f.engine.login());

        assert_eq!(logged_in.unwrap().id, "user-2");
        assert_eq!(refreshed, Err(AuthError::SessionSuperseded));
        assert_eq!(f.engine.user().unwrap().id, "user-2");
        let record = stored(&f.tokens).unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-user-2"));
        assert_eq!(f.engine.tokens(), Some(record));
        assert!(f.engine.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_fires() {
        let f = fixture();
        let record = TokenRecord::new(access_token("user-1"))
            .with_refresh_token("refresh-1")
            .with_expires_at(now_millis() + 301_000);
        f.engine.set_tokens(record).unwrap();
        f.transport.respond(token_response("user-1"));

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(f.transport.requests_to(&f.engine.config().token_url()), 1);
        assert_eq!(
            f.engine.tokens().unwrap().refresh_token.as_deref(),
            Some("refresh-2")
        );
    }

    #[tokio::test]
    async fn test_auto_refresh_disabled() {
        let mut config = test_config();
        config.auto_refresh = false;
        let f = fixture_with(config, RecordingTransport::new());

        f.engine.set_tokens(live_record("user-1")).unwrap();
        assert!(!f.engine.inner.scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_subscriber_sees_persisted_tokens() {
        let f = fixture();
        let durable = Arc::new(AtomicUsize::new(0));

        let backend = f.tokens.clone();
        let counter = durable.clone();
        f.engine.on_state_changed(move |state| {
            if state.is_authenticated && stored(&backend).is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        f.engine.set_tokens(live_record("user-1")).unwrap();
        assert_eq!(durable.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_inside_callback() {
        let f = fixture();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let own = slot.clone();
        let calls = first_calls.clone();
        let subscription = f.engine.on_state_changed(move |_| {
            // The first call is the registration replay
            if calls.fetch_add(1, Ordering::SeqCst) >= 1
                && let Some(subscription) = own.lock().take()
            {
                subscription.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        let calls = second_calls.clone();
        f.engine.on_state_changed(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        f.engine.set_tokens(live_record("user-1")).unwrap();
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 2);

        f.engine.reset_to_unauthenticated();
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_subscription_replays_current_state() {
        let f = fixture();
        f.engine.set_tokens(live_record("user-1")).unwrap();

        let seen = record_states(&f.engine);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_authenticated);
    }

    #[test]
    fn test_failed_save_leaves_engine_unauthenticated() {
        let engine = AuthEngine::builder(test_config())
            .token_backend(Arc::new(FailingStore::quota_exceeded()))
            .build()
            .unwrap();

        let result = engine.set_tokens(live_record("user-1"));
        assert_eq!(
            result,
            Err(AuthError::Storage(StorageError::QuotaExceeded))
        );
        assert!(!engine.is_authenticated());
    }

    #[test]
    fn test_set_tokens_rejects_opaque_token() {
        let f = fixture();
        let result = f.engine.set_tokens(TokenRecord::new("opaque"));
        assert!(matches!(result, Err(AuthError::Validation(_))));
        assert!(f.tokens.is_empty());
    }

    #[test]
    fn test_authorize_policy() {
        let f = fixture();
        let policy = AccessPolicy::authenticated().with_permissions(["read:reports"]);
        assert_eq!(
            f.engine.authorize(&policy),
            Err(AccessDenied::Unauthenticated)
        );

        let token = make_jwt(
            None,
            json!({ "sub": "u1", "permissions": ["read:reports"], "exp": now_secs() + 60 }),
        );
        f.engine.set_tokens(TokenRecord::new(token)).unwrap();
        assert_eq!(f.engine.authorize(&policy), Ok(()));
        assert!(f.engine.has_permission("read:reports"));
        assert!(f.engine.has_any_permission(["write:reports", "read:reports"]));
    }

    #[test]
    fn test_native_defaults() {
        let mut config = test_config();
        config.storage = StorageBackend::LocalStorage;
        assert!(matches!(
            AuthEngine::new(config),
            Err(AuthError::Storage(StorageError::Unavailable(_)))
        ));

        let mut config = test_config();
        config.token_validation = true;
        assert!(AuthEngine::new(config).is_ok());

        let mut config = test_config();
        config.client_id = String::new();
        assert!(matches!(
            AuthEngine::new(config),
            Err(AuthError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_login_without_popup_support() {
        let engine = AuthEngine::new(test_config()).unwrap();
        assert!(matches!(
            engine.login().await,
            Err(AuthError::Configuration(_))
        ));
        assert!(!engine.is_loading());
    }

    #[tokio::test]
    async fn test_popup_side_callback_through_engine() {
        let f = fixture();
        let result = f
            .engine
            .handle_redirect_callback(&CallbackParams::from_query("code=c&state=unknown"))
            .await;
        assert_eq!(result, Err(AuthError::InvalidState));

        let message = AuthMessage::Error {
            error: AuthError::InvalidState.to_string(),
            reason: Some(AuthError::InvalidState),
        };
        assert!(serde_json::to_string(&message).unwrap().contains("AUTH_ERROR"));
    }
}
