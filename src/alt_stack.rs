use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Pages for the alternate stack proper, beyond the platform minimum.
/// The handler assembles its message on the stack, captures up to 100
/// frames, and runs the logger, so the default SIGSTKSZ (8 KiB on Linux)
/// is far too tight.
const ALT_STACK_PAGES: usize = 64;

static STACK_BASE: AtomicPtr<libc::c_void> = AtomicPtr::new(ptr::null_mut());
static STACK_TOTAL: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Allocate and install the alternate signal stack, so the crash handler
/// can run even when the faulting thread's own stack is exhausted.
///
/// Best-effort: any failure leaves the default stack in place, meaning a
/// stack-overflow-induced fault may not produce a clean diagnostic, but
/// nothing else degrades. Applies to the calling thread; install before
/// arming the signal handlers, from the thread that matters (main).
pub(crate) fn initialize() {
    if INSTALLED.load(Ordering::SeqCst) {
        return;
    }

    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return;
    }
    let page = page as usize;
    let stack_size = std::cmp::max(libc::SIGSTKSZ, ALT_STACK_PAGES * page);
    let total = stack_size + page;

    // Anonymous mapping with a PROT_NONE guard page at the low end, so a
    // handler overrunning the alternate stack faults loudly instead of
    // scribbling over whatever mmap placed next to it.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        tracing::debug!(target: "crash", "alternate signal stack allocation failed, using default stack");
        return;
    }
    if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
        unsafe { libc::munmap(base, total) };
        return;
    }

    let stack = libc::stack_t {
        ss_sp: unsafe { base.add(page) },
        ss_flags: 0,
        ss_size: stack_size,
    };
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        unsafe { libc::munmap(base, total) };
        tracing::debug!(target: "crash", "sigaltstack registration failed, using default stack");
        return;
    }

    STACK_BASE.store(base, Ordering::SeqCst);
    STACK_TOTAL.store(total, Ordering::SeqCst);
    INSTALLED.store(true, Ordering::SeqCst);
}

/// Disable the alternate stack and release its memory. Best-effort;
/// intended for orderly shutdown near process exit.
pub(crate) fn teardown() {
    if !INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }

    let disable = libc::stack_t {
        ss_sp: ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    // Failure here is non-fatal; the mapping is reclaimed at exit anyway.
    if unsafe { libc::sigaltstack(&disable, ptr::null_mut()) } != 0 {
        return;
    }

    let base = STACK_BASE.swap(ptr::null_mut(), Ordering::SeqCst);
    let total = STACK_TOTAL.swap(0, Ordering::SeqCst);
    if !base.is_null() && total > 0 {
        unsafe { libc::munmap(base, total) };
    }
}

/// Whether the alternate stack is currently installed.
pub(crate) fn installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the install state is process-global and the test
    // harness runs separate tests in parallel.
    #[test]
    fn test_lifecycle_install_teardown_reinstall() {
        initialize();
        assert!(installed());
        // Re-initializing while installed is a no-op.
        initialize();
        assert!(installed());

        teardown();
        assert!(!installed());
        // Teardown is idempotent.
        teardown();
        assert!(!installed());

        // A fresh install works after a full teardown.
        initialize();
        assert!(installed());
        teardown();
        assert!(!installed());
    }
}
