//! # dxauth
//!
//! Browser-side OAuth2/OIDC authentication for Rust web apps: popup-based
//! Authorization Code + PKCE login, durable token storage, proactive refresh,
//! JWT claim validation and an observable authentication state.
//!
//! ## Overview
//!
//! - **Shared types** (`AuthConfig`, `User`, `AuthError`) - available everywhere
//! - **Engine** (`AuthEngine`) - the single entry point for login, logout,
//!   refresh, guarded requests and state subscriptions
//! - **Guards** (`guard::AccessPolicy`) - role and permission checks against
//!   the published state
//! - **Dioxus hooks** (feature `dioxus`) - `use_auth_provider` / `use_auth`
//!
//! ## Platform Compatibility
//!
//! | Piece | WASM (browser) | Native |
//! |-------|----------------|--------|
//! | Engine, flow, validation | ✅ | ✅ |
//! | `localStorage` / `sessionStorage` / cookie stores | ✅ | ❌ |
//! | Popup login | ✅ | via a custom `PopupOpener` |
//! | `jsonwebtoken` signature verifier | ❌ (plug in a `SignatureVerifier`) | ✅ |
//!
//! Browser-only code is selected with `cfg(target_arch = "wasm32")`; native
//! builds run the engine on tokio.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dxauth::{AuthConfig, AuthEngine};
//!
//! let engine = AuthEngine::new(AuthConfig::from_env_or_panic())?;
//! let state = engine.initialize().await;
//!
//! if !state.is_authenticated {
//!     let user = engine.login().await?;
//!     tracing::info!("Hello, {}!", user.display_name());
//! }
//! ```
//!
//! The callback page loaded in the popup finishes the flow:
//!
//! ```rust,ignore
//! // wasm32 only
//! engine.complete_popup_login().await?;
//! ```
//!
//! ## Security
//!
//! `AuthConfig::token_validation` (on by default) verifies token signatures
//! against the issuer's JWKS. Turning it off trusts tokens on TLS alone and
//! should only be done deliberately.

pub mod client;
pub mod config;
pub mod error;
pub mod guard;
pub mod user;

pub use client::engine::{AuthEngine, AuthEngineBuilder, AuthState, Subscription};
pub use config::{AuthConfig, CookieOptions, SameSite, StorageBackend};
pub use error::{AuthError, StorageError, ValidationError};
pub use guard::{AccessDenied, AccessPolicy};
pub use user::User;

#[cfg(feature = "dioxus")]
pub use client::use_auth::{AuthContext, use_auth, use_auth_provider};
