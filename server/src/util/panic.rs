//! Panic isolation for handler invocations.
//!
//! A process wide hook records the stack of the most recent panic on the
//! panicking thread; [`guard`] catches the unwind and turns it into
//! [`CallError::Panic`] with that stack attached.

use futures_util::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use crate::error::CallError;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Installs the backtrace capturing hook once, chaining the previous hook.
pub fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Runs `fut`, converting a panic into [`CallError::Panic`].
///
/// # Errors
///
/// Returns the future's own error, or the recovered panic.
pub async fn guard<T, F>(fut: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    install_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let backtrace = LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default();
            tracing::error!(panic = %message, "recovered from handler panic");
            Err(CallError::Panic { message, backtrace })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
