//! Capture of diagnostic traces for panicking task logic.
//!
//! A panic is caught at the worker boundary, after the stack has unwound, so
//! the backtrace has to be taken inside the panic hook. [`install`] chains a
//! hook in front of the previous one that records the panic location and a
//! backtrace in a thread-local slot. The worker that catches the unwind on the
//! same thread collects it with [`take`].

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{PanicHookInfo, take_hook};
use std::sync::Once;

static INSTALL: Once = Once::new();

thread_local! {
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install the capturing hook. Only the first call has an effect.
pub fn install() {
    INSTALL.call_once(|| {
        let previous_hook = take_hook();
        std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
            let record = format_trace(panic_info);
            LAST_TRACE.with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(record);
                }
            });

            // Preserve the default hook output.
            previous_hook(panic_info);
        }));
    });
}

/// Take the trace recorded by the most recent panic on this thread.
pub fn take() -> Option<String> {
    LAST_TRACE.with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
}

/// Discard any stale trace so the next [`take`] only sees a fresh panic.
pub fn clear() {
    let _ = take();
}

fn format_trace(panic_info: &PanicHookInfo<'_>) -> String {
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread_name = std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    let backtrace = Backtrace::force_capture();
    format!("panicked at {location} (thread={thread_name})\nBacktrace:\n{backtrace}")
}
