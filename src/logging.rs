//! Tracing setup for binaries and tests.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;
use tracing_subscriber::EnvFilter;

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Returns `false` if a subscriber
/// was already installed, which is not an error.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Route panics through `tracing` before the default hook runs, so a
/// subscriber callback that panics inside the receive loop leaves a log line.
pub fn install_panic_hook() {
    if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let thread = std::thread::current();

        error!(
            thread = thread.name().unwrap_or("unnamed"),
            %location,
            %message,
            "Panic"
        );
        default_hook(info);
    }));
}
