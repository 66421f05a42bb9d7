//! Dioxus hooks over `AuthEngine`.
//!
//! The provider mirrors the engine's published state into a signal, so
//! components re-render on login, refresh and logout. The hooks only read
//! that state and forward actions to the engine.

use crate::client::engine::{AuthEngine, AuthState};
use crate::guard::{AccessDenied, AccessPolicy};
use crate::User;
use dioxus::prelude::*;

/// Provides authentication context to the component tree.
///
/// Call once at the root of the app. `init` runs on first render only; the
/// engine is then restored from storage in the background.
///
/// # Example
///
/// ```ignore
/// #[component]
/// pub fn App() -> Element {
///     use_auth_provider(|| {
///         AuthEngine::new(AuthConfig::from_env_or_panic()).expect("auth engine")
///     });
///     // ... rest of app
/// }
/// ```
pub fn use_auth_provider(init: impl FnOnce() -> AuthEngine) -> AuthContext {
    let state = use_signal_sync(AuthState::default);

    let (context, subscription) = use_hook(move || {
        let engine = init();
        let subscription = engine.on_state_changed(move |next| {
            let mut state = state;
            state.set(next.clone());
        });

        let restoring = engine.clone();
        spawn(async move {
            let restored = restoring.initialize().await;
            tracing::trace!(
                "Auth state restored: authenticated={}",
                restored.is_authenticated
            );
        });

        (AuthContext { engine, state }, subscription)
    });

    use_drop(move || subscription.unsubscribe());
    use_context_provider(|| context.clone());
    context
}

/// Returns the context set up by `use_auth_provider`.
///
/// # Panics
///
/// Panics if no ancestor called `use_auth_provider()`.
pub fn use_auth() -> AuthContext {
    use_context::<AuthContext>()
}

/// Handle returned by `use_auth`.
#[derive(Clone)]
pub struct AuthContext {
    engine: AuthEngine,
    state: Signal<AuthState, SyncStorage>,
}

impl PartialEq for AuthContext {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl AuthContext {
    pub fn engine(&self) -> &AuthEngine {
        &self.engine
    }

    /// Current state; reading it subscribes the calling component.
    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.state.read().loading
    }

    pub fn user(&self) -> Option<User> {
        self.state.read().user.clone()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.state
            .read()
            .user
            .as_ref()
            .is_some_and(|u| u.has_role(role))
    }

    pub fn authorize(&self, policy: &AccessPolicy) -> Result<(), AccessDenied> {
        policy.check(&self.state.read())
    }

    /// Starts the popup login in the background.
    pub fn login(&self) {
        let engine = self.engine.clone();
        spawn(async move {
            match engine.login().await {
                Ok(user) => tracing::trace!("Login complete for {}", user.id),
                Err(e) if e.is_abandoned_login() => tracing::trace!("Login abandoned: {}", e),
                Err(e) => tracing::error!("Login failed: {}", e),
            }
        });
    }

    /// Logs out in the background.
    pub fn logout(&self) {
        let engine = self.engine.clone();
        spawn(async move {
            engine.logout().await;
        });
    }
}
