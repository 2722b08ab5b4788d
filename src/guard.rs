use std::sync::atomic::{AtomicBool, Ordering};

/// How long a thread that lost the crash race waits for the winner's
/// diagnostics before falling through to the re-raise.
const LOSER_WAIT_SECS: libc::time_t = 5;

/// Serializes entry into the crash diagnostic path without a mutex
/// (mutexes are not async-signal-safe).
///
/// The first thread to test-and-set the flag runs the full diagnostic
/// sequence; any other thread faulting while the flag is held sleeps a
/// bounded interval and then re-raises without writing a second report.
/// The flag is reset only by the pre-crash filename-preparation path,
/// which borrows it briefly to avoid racing an actual crash at startup.
pub(crate) struct CrashGuard {
    engaged: AtomicBool,
}

impl CrashGuard {
    pub(crate) const fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    /// Atomically test-and-set. Returns true if this caller won entry.
    pub(crate) fn try_acquire(&self) -> bool {
        !self.engaged.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }
}

/// Process-wide guard shared by the signal handler and the filename
/// preparation path.
pub(crate) static GUARD: CrashGuard = CrashGuard::new();

/// Bounded sleep for threads that lost the crash race.
///
/// Uses `nanosleep` directly rather than `std::thread::sleep`, which is
/// not audited for use inside a signal handler. Resumes after EINTR so
/// the winner's diagnostics get the full window.
pub(crate) fn wait_for_winner() {
    let mut remaining = libc::timespec {
        tv_sec: LOSER_WAIT_SECS,
        tv_nsec: 0,
    };
    loop {
        let mut rem = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::nanosleep(&remaining, &mut rem) };
        if rc == 0 || nix::errno::Errno::last() != nix::errno::Errno::EINTR {
            return;
        }
        remaining = rem;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_acquire_wins_then_loses() {
        let guard = CrashGuard::new();
        assert!(guard.try_acquire());
        assert!(!guard.try_acquire());
        assert!(!guard.try_acquire());
    }

    #[test]
    fn test_reset_reopens_entry() {
        let guard = CrashGuard::new();
        assert!(guard.try_acquire());
        guard.reset();
        assert!(guard.try_acquire());
    }

    #[test]
    fn test_only_one_thread_acquires() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        static SHARED: CrashGuard = CrashGuard::new();
        let winners = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    if SHARED.try_acquire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
