//! Process crash handler: intercepts fatal signals (SIGSEGV, SIGBUS,
//! SIGILL, SIGFPE, SIGABRT), records diagnostics — crash message, raw
//! backtrace, memory stats — without heap allocation in the critical
//! path, then restores the default disposition and re-raises the signal
//! so the OS still produces a core dump and a killed-by-signal exit
//! status.
//!
//! Typical startup sequence:
//!
//! ```no_run
//! crashguard::install_crash_handler();
//! crashguard::set_temp_filename();
//! ```
//!
//! Setup failures (alternate-stack allocation, temp filename generation,
//! per-signal registration) silently degrade the diagnostics and never
//! prevent startup. On non-unix targets installation is a no-op.

#[cfg(unix)]
mod alt_stack;
#[cfg(unix)]
mod filename;
#[cfg(unix)]
mod guard;
#[cfg(unix)]
mod handler;
#[cfg(unix)]
mod msgbuf;
#[cfg(unix)]
mod procinfo;

use std::sync::atomic::{AtomicBool, Ordering};

/// Register the crash handler for all fatal signals and install the
/// alternate signal stack.
///
/// Idempotent; only the first call has any effect. Registration is
/// best-effort per signal: a signal that cannot be intercepted keeps its
/// previous disposition and the rest are still armed. Call early, from
/// the main thread (the alternate stack applies to the installing
/// thread).
pub fn install_crash_handler() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    #[cfg(unix)]
    {
        alt_stack::initialize();
        handler::install_all();
        tracing::debug!(
            target: "crash",
            alt_stack = alt_stack::installed(),
            "crash handler installed"
        );
    }
}

/// Precompute the temporary filename the handler writes the raw
/// backtrace into.
///
/// Must run during normal (non-signal) execution, typically once at
/// startup; calling again is harmless and the last successful result
/// wins. On failure the handler simply skips file-based reporting.
pub fn set_temp_filename() {
    #[cfg(unix)]
    filename::prepare();
}

/// Disable and release the alternate signal stack. Best-effort, intended
/// for orderly shutdown near process exit.
pub fn teardown() {
    #[cfg(unix)]
    alt_stack::teardown();
}

/// Report an unrecoverable error and terminate the process.
///
/// The context is logged and also recorded so the SIGABRT crash report
/// carries it, giving programmer-detected fatal errors the same
/// structured diagnostics as OS-detected faults. Never returns.
pub fn crash(context: &str) -> ! {
    tracing::error!(target: "crash", context, "fatal error, terminating process");
    #[cfg(unix)]
    {
        handler::CRASH_CONTEXT.set(context.as_bytes());
        std::process::abort();
    }
    #[cfg(not(unix))]
    {
        // No signal redelivery here; exit with the deterministic
        // signal-derived substitute status (SIGABRT = 6).
        std::process::exit(255 + 6);
    }
}

/// Report a failed internal assertion and terminate the process.
///
/// Funnels into [`crash`] so invariant violations produce the same crash
/// report as genuine faults. Never returns.
pub fn assertion_failure(file: &str, line: u32, expr: &str) -> ! {
    tracing::error!(target: "crash", file, line, expr, "assertion failed");
    // Normal execution context; allocating for the message is fine here.
    let context = format!("assertion failed in {file}:{line}: {expr}");
    crash(&context)
}
