//! The fatal-signal handler: builds a crash message in a fixed buffer,
//! captures a raw backtrace, dumps it to the precomputed crash file,
//! logs process resource usage, and re-raises the signal so the OS
//! performs its default fatal action (core dump, signal exit status).
//!
//! Everything up to the first logger call is strictly async-signal-safe:
//! no allocation, no locking, only raw syscalls and fixed buffers. The
//! logger calls themselves are a deliberate, documented relaxation of
//! that contract — `tracing` may allocate — accepted because the
//! alternative is losing the diagnostics entirely (see DESIGN.md).

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::filename;
use crate::guard::{self, GUARD};
use crate::msgbuf::{MsgBuf, StaticText};
use crate::procinfo;

/// Signals intercepted for crash diagnostics.
pub(crate) const FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
];

/// Maximum raw return addresses captured.
const MAX_FRAMES: usize = 100;

/// Leading crash-file lines belonging to the handler itself (the handler
/// frame and the backtrace-capture frame), skipped when re-streaming.
const SKIP_FRAMES: usize = 2;

/// Capacity of the on-stack crash-message buffer.
const MSG_CAPACITY: usize = 1024;

/// Bound on crash-file bytes re-streamed through the logger.
const RESTREAM_CAPACITY: usize = 64 * 1024;

/// Optional context recorded by `crash()` before it aborts, so a
/// deliberate termination carries its reason into the crash message.
pub(crate) static CRASH_CONTEXT: StaticText<256> = StaticText::new();

/// Thread that installed the handlers (and owns the large alternate
/// stack). Used to scope the stack-hungry debug print to that thread.
static MAIN_TID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Register the handler for every fatal signal, best-effort per signal.
///
/// One-shot semantics (`SA_RESETHAND`) keep a fault inside the handler
/// from recursing, and `SA_ONSTACK` routes delivery onto the alternate
/// stack when one is installed.
pub(crate) fn install_all() {
    MAIN_TID.store(thread_id(), std::sync::atomic::Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::SigAction(crash_signal_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK | SaFlags::SA_RESETHAND | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    for sig in FATAL_SIGNALS {
        if let Err(err) = unsafe { signal::sigaction(sig, &action) } {
            tracing::warn!(target: "crash", signal = %sig, %err, "failed to install crash handler for signal");
        }
    }
}

/// Entry point invoked by the OS on signal delivery.
///
/// Exactly one thread proceeds into the diagnostic sequence; a thread
/// faulting while another is diagnosing sleeps a bounded interval and
/// then re-raises, letting the winner's re-raise (or its own) kill the
/// process. No path returns to the faulting code.
pub(crate) extern "C" fn crash_signal_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    if !GUARD.try_acquire() {
        guard::wait_for_winner();
        reraise(signum);
    }

    // A panic must never unwind across the signal frame; anything the
    // diagnostic sequence throws is discarded and we proceed to die.
    let _ = catch_unwind(AssertUnwindSafe(|| diagnose(signum, info)));

    reraise(signum);
}

/// The DIAGNOSING sequence. Every fallible step degrades to "skip this
/// enrichment"; only the re-raise in the caller is unconditional.
fn diagnose(signum: libc::c_int, info: *mut libc::siginfo_t) {
    // Raw symbolized print for developer builds. NOT async-signal-safe
    // (allocates and takes symbolization locks); compiled out of release
    // builds where the safety contract holds strictly. Symbolization is
    // also stack-hungry, so it only runs on the thread that owns the
    // large alternate stack.
    #[cfg(debug_assertions)]
    if thread_id() == MAIN_TID.load(std::sync::atomic::Ordering::SeqCst) {
        let bt = backtrace::Backtrace::new();
        let _ = writeln!(std::io::stderr(), "{bt:?}");
    }

    // Assemble the crash message in a fixed on-stack buffer. Only memory
    // copies and table lookups; no formatting machinery.
    let mut msg = MsgBuf::<MSG_CAPACITY>::new();
    msg.push_str(concat!(
        env!("CARGO_PKG_NAME"),
        " v",
        env!("CARGO_PKG_VERSION")
    ));
    msg.push_str(": thread ");
    msg.push_u64(thread_id());

    let mut name = [0u8; 16];
    let name_len = thread_name(&mut name);
    if name_len > 0 {
        msg.push_str(" [");
        msg.push_bytes(&name[..name_len]);
        msg.push_str("]");
    }

    msg.push_str(" caught unexpected signal ");
    msg.push_u64(signum as u64);
    msg.push_str(" (");
    msg.push_str(signal_name(signum));
    msg.push_str(")");

    // The faulting address is only meaningful for memory faults.
    if signum == libc::SIGSEGV || signum == libc::SIGBUS {
        msg.push_str(" accessing address 0x");
        msg.push_hex(fault_address(info) as u64);
    }

    if !CRASH_CONTEXT.is_empty() {
        let mut context = [0u8; 256];
        let n = CRASH_CONTEXT.read_into(&mut context);
        msg.push_str(": ");
        msg.push_bytes(&context[..n]);
    }

    // Capture the backtrace before finishing the message so the frame
    // count can be part of it.
    let mut frames = [ptr::null_mut::<libc::c_void>(); MAX_FRAMES];
    let depth = capture_backtrace(&mut frames);

    msg.push_str(". displaying ");
    msg.push_u64(depth as u64);
    msg.push_str(" stack frame(s)");

    // Relaxation point: from here on the logger may allocate.
    tracing::error!(target: "crash", "{}", msg.as_str());

    if depth > 0 && dump_backtrace_file(&frames[..depth]) {
        restream_crash_file();
    }

    let stats = procinfo::collect();
    tracing::info!(
        target: "crash",
        resident_bytes = stats.resident_bytes,
        virtual_bytes = stats.virtual_bytes,
        threads = stats.thread_count,
        available_bytes = stats.available_bytes,
        "process resource usage at crash"
    );

    // Last "be nice" action before default signal semantics take over.
    let _ = std::io::stderr().flush();
}

/// Restore the default disposition and redeliver, so the OS performs its
/// standard fatal action (core dump, killed-by-signal exit status). The
/// exit call is a deterministic substitute if redelivery somehow fails.
fn reraise(signum: libc::c_int) -> ! {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signum, &action, ptr::null_mut());
        libc::kill(libc::getpid(), signum);
        // _exit, not exit: runtime cleanup must not run in a signal frame.
        libc::_exit(255 + signum)
    }
}

/// Capture up to `frames.len()` raw return addresses via the platform
/// backtrace primitive (async-signal-safe, unlike the symbolizing
/// variants). Returns 0 where the platform has no such primitive.
#[cfg(any(target_os = "macos", all(target_os = "linux", target_env = "gnu")))]
fn capture_backtrace(frames: &mut [*mut libc::c_void]) -> usize {
    let n = unsafe { libc::backtrace(frames.as_mut_ptr(), frames.len() as libc::c_int) };
    if n > 0 {
        n as usize
    } else {
        0
    }
}

#[cfg(not(any(target_os = "macos", all(target_os = "linux", target_env = "gnu"))))]
fn capture_backtrace(_frames: &mut [*mut libc::c_void]) -> usize {
    0
}

/// Write the raw backtrace to the precomputed crash file using the
/// signal-safe symbol-dump primitive. Exclusive create, owner-only
/// permissions; any failure skips file-based reporting.
fn dump_backtrace_file(frames: &[*mut libc::c_void]) -> bool {
    let mut path = [0u8; 1025];
    let len = filename::read_into(&mut path[..1024]);
    if len == 0 {
        return false;
    }

    let fd = unsafe {
        libc::open(
            path.as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC,
            0o600 as libc::c_uint,
        )
    };
    if fd < 0 {
        return false;
    }

    dump_symbols(frames, fd);
    unsafe { libc::close(fd) };
    true
}

#[cfg(any(target_os = "macos", all(target_os = "linux", target_env = "gnu")))]
fn dump_symbols(frames: &[*mut libc::c_void], fd: libc::c_int) {
    unsafe {
        // The _fd variant writes directly to the descriptor; the variant
        // that resolves names into strings allocates and must not be used
        // here.
        libc::backtrace_symbols_fd(frames.as_ptr(), frames.len() as libc::c_int, fd);
    }
}

#[cfg(not(any(target_os = "macos", all(target_os = "linux", target_env = "gnu"))))]
fn dump_symbols(_frames: &[*mut libc::c_void], _fd: libc::c_int) {}

/// Re-stream the crash file through the logger line-by-line, skipping the
/// handler's own leading frames. Bounded by a static buffer; a file
/// larger than the bound is truncated, not followed.
fn restream_crash_file() {
    // Static rather than on-stack: 64 KiB would be a large bite out of
    // the alternate stack. Only the guard winner ever gets here, so the
    // buffer is effectively single-threaded.
    static mut RESTREAM_BUF: [u8; RESTREAM_CAPACITY] = [0; RESTREAM_CAPACITY];

    let mut path = [0u8; 1025];
    let len = filename::read_into(&mut path[..1024]);
    if len == 0 {
        return;
    }

    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        return;
    }

    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            ptr::addr_of_mut!(RESTREAM_BUF) as *mut u8,
            RESTREAM_CAPACITY,
        )
    };
    let n = procinfo::read_fd(fd, buf);
    unsafe { libc::close(fd) };

    if let Ok(path_str) = std::str::from_utf8(&path[..len]) {
        tracing::info!(target: "crash", path = path_str, "backtrace written to crash file");
    }

    for line in buf[..n].split(|&b| b == b'\n').skip(SKIP_FRAMES) {
        if line.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(line).unwrap_or("<non-utf8 frame>");
        tracing::info!(target: "crash", "{}", text);
    }
}

/// Numeric id of the current thread.
#[cfg(target_os = "linux")]
fn thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// Fetch the current thread's name into `out` (Linux caps names at 16
/// bytes including the terminator). Returns the name length, 0 if
/// unavailable.
#[cfg(target_os = "linux")]
fn thread_name(out: &mut [u8; 16]) -> usize {
    let rc = unsafe { libc::prctl(libc::PR_GET_NAME, out.as_mut_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return 0;
    }
    out.iter().position(|&b| b == 0).unwrap_or(out.len())
}

#[cfg(not(target_os = "linux"))]
fn thread_name(_out: &mut [u8; 16]) -> usize {
    0
}

/// Faulting address from siginfo, for SIGSEGV/SIGBUS.
#[cfg(target_os = "linux")]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(target_os = "linux"))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    unsafe { (*info).si_addr as usize }
}

/// Symbolic name for an intercepted signal.
fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        _ => "UNKNOWN",
    }
}
