//! Token lifecycle and popup PKCE login.
//!
//! Leaves first:
//! - `token_storage` - durable token record over a key/value backend
//! - `pkce` - verifier/challenge pairs, `state`, CSRF tokens
//! - `jwt`, `jwks`, `validation` - decoding, claim checks, delegated signatures
//! - `scheduler` - proactive refresh timer
//! - `exchange` - token and revocation endpoint calls
//! - `flow` - popup authorization-code flow and redirect callback
//! - `engine` - the state machine composing all of the above
//!
//! `browser` holds the `web-sys` backends and is only built for `wasm32`.
//!
//! # Example
//!
//! ```rust,ignore
//! use dxauth::{AuthConfig, AuthEngine};
//! use dxauth::client::http_client::HttpRequest;
//!
//! let engine = AuthEngine::new(AuthConfig::from_env_or_panic())?;
//! engine.initialize().await;
//!
//! engine.on_state_changed(|state| {
//!     tracing::info!("authenticated: {}", state.is_authenticated);
//! });
//!
//! // Logs in or refreshes as needed, then attaches the bearer token
//! let response = engine.fetch(HttpRequest::get("https://api.example.com/me")).await?;
//! ```

pub mod engine;
pub mod exchange;
pub mod flow;
pub mod http_client;
pub mod jwks;
pub mod jwt;
pub mod pkce;
pub mod runtime;
pub mod scheduler;
pub mod token_storage;
pub mod validation;

#[cfg(target_arch = "wasm32")]
pub mod browser;

#[cfg(feature = "dioxus")]
pub mod use_auth;

#[cfg(all(test, not(target_arch = "wasm32")))]
pub(crate) mod testing;

pub use engine::{AuthEngine, AuthEngineBuilder, AuthState, Subscription};
pub use flow::{CallbackParams, FlowState};
pub use http_client::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use pkce::{PkcePair, generate_code_challenge, generate_code_verifier};
pub use token_storage::{KeyValueStore, MemoryStore, TokenRecord, TokenStore};
