//! Executor and clock shims for the two targets the crate runs on.
//!
//! In the browser everything is single-threaded and futures are `!Send`; on
//! native targets the engine runs on tokio and its futures must be `Send`.
//! `MaybeSend` and the boxed aliases below paper over that difference so the
//! rest of the crate can be written once.

use std::future::Future;
use std::time::Duration;

/// `Send + Sync` on native targets, no bound at all in the browser.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync + ?Sized> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSend for T {}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

#[cfg(not(target_arch = "wasm32"))]
pub type BoxStream<'a, T> = futures::stream::BoxStream<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxStream<'a, T> = futures::stream::LocalBoxStream<'a, T>;

/// Runs a future in the background.
///
/// Must be called from within a tokio runtime on native targets.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}

/// Runs a future in the background on the browser's microtask queue.
#[cfg(target_arch = "wasm32")]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Waits for `duration`.
#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Waits for `duration` using `setTimeout`.
///
/// Dropping the returned future clears the pending timeout.
#[cfg(target_arch = "wasm32")]
pub async fn sleep(duration: Duration) {
    let Some(window) = web_sys::window() else {
        tracing::warn!("No window available; sleep returns immediately");
        return;
    };

    let millis = duration.as_millis().min(i32::MAX as u128) as i32;
    let mut handle = None;
    let promise = js_sys::Promise::new(&mut |resolve, _reject| {
        handle = window
            .set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, millis)
            .ok();
    });

    let _timer = TimeoutGuard { window, handle };
    let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
}

#[cfg(target_arch = "wasm32")]
struct TimeoutGuard {
    window: web_sys::Window,
    handle: Option<i32>,
}

#[cfg(target_arch = "wasm32")]
impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.window.clear_timeout_with_handle(handle);
        }
    }
}

/// Returns the current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now() as i64
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Returns the current Unix time in whole seconds.
pub fn now_secs() -> i64 {
    now_millis() / 1000
}
