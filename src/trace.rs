//! # Allocator Tracepoints
//!
//! Events go through the [`log`] facade. Two rules keep this safe when we are
//! the process allocator:
//! - Events are only emitted once the ledger lock has been released, since the
//!   logger may allocate through us.
//! - An event emitted while the logger is already running on this thread is
//!   dropped, otherwise every allocation made by the logger would log again.

use std::cell::Cell;

thread_local! {
    static IN_LOGGER: Cell<bool> = const { Cell::new(false) };
}

/// Runs `emit` unless a log record is already being written on this thread.
pub(crate) fn guarded(emit: impl FnOnce()) {
    let _ = IN_LOGGER.try_with(|busy| {
        if busy.replace(true) {
            return;
        }
        emit();
        busy.set(false);
    });
}

/// `log!` behind [`guarded`].
macro_rules! event {
    ($level:expr, $($arg:tt)+) => {
        $crate::trace::guarded(|| {
            if ::log::log_enabled!($level) {
                ::log::log!($level, $($arg)+);
            }
        })
    };
}

pub(crate) use event;
