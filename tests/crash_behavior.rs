//! End-to-end crash behavior, observed from outside: each fault kind
//! must terminate the probe with the original signal, and the log output
//! must carry the structured crash report.

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

fn run_probe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crashprobe"))
        .args(args)
        .output()
        .expect("failed to spawn crashprobe")
}

fn run_probe_with_tmpdir(args: &[&str], tmpdir: &std::path::Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crashprobe"))
        .args(args)
        .env("TMPDIR", tmpdir)
        .output()
        .expect("failed to spawn crashprobe")
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn test_each_fault_dies_with_its_signal() {
    let cases = [
        ("null-deref", libc::SIGSEGV),
        ("bus", libc::SIGBUS),
        ("ill", libc::SIGILL),
        ("fpe", libc::SIGFPE),
        ("abort", libc::SIGABRT),
    ];
    for (fault, signum) in cases {
        let out = run_probe(&[fault]);
        assert_eq!(
            out.status.signal(),
            Some(signum),
            "fault {fault} should die by signal {signum}, got {:?}\nstderr:\n{}",
            out.status,
            stderr_of(&out)
        );
    }
}

#[test]
fn test_null_deref_reports_signal_and_address() {
    let out = run_probe(&["null-deref"]);
    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("caught unexpected signal 11"),
        "missing signal line in:\n{stderr}"
    );
    assert!(
        stderr.contains("accessing address 0x0"),
        "missing fault address in:\n{stderr}"
    );
    assert!(
        stderr.contains("stack frame(s)"),
        "missing frame count in:\n{stderr}"
    );
}

#[test]
fn test_crash_report_includes_memory_summary() {
    let out = run_probe(&["null-deref"]);
    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("process resource usage at crash"),
        "missing memory summary in:\n{stderr}"
    );
}

#[test]
fn test_backtrace_file_written_and_restreamed() {
    let tmpdir = tempfile::tempdir().unwrap();
    let out = run_probe_with_tmpdir(&["null-deref"], tmpdir.path());
    assert_eq!(out.status.signal(), Some(libc::SIGSEGV));

    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("backtrace written to crash file"),
        "missing crash file line in:\n{stderr}"
    );

    // Offline round-trip smoke test: the file exists, is non-empty, and
    // holds one symbol/address per line.
    let crash_files: Vec<_> = std::fs::read_dir(tmpdir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("crash-backtrace-")
        })
        .collect();
    assert_eq!(crash_files.len(), 1, "expected exactly one crash file");

    let content = std::fs::read_to_string(crash_files[0].path()).unwrap();
    let lines: Vec<_> = content.lines().filter(|l| !l.is_empty()).collect();
    assert!(
        lines.len() >= 3,
        "crash file should hold a real backtrace, got:\n{content}"
    );
}

#[test]
fn test_missing_crash_file_degrades_gracefully() {
    let out = run_probe(&["null-deref", "--no-crash-file"]);
    assert_eq!(out.status.signal(), Some(libc::SIGSEGV));

    let stderr = stderr_of(&out);
    // Crash message and memory summary still present...
    assert!(stderr.contains("caught unexpected signal 11"));
    assert!(stderr.contains("process resource usage at crash"));
    // ...only the file-based backtrace section is skipped.
    assert!(
        !stderr.contains("backtrace written to crash file"),
        "file section should be skipped in:\n{stderr}"
    );
}

#[test]
fn test_stack_overflow_handled_on_alternate_stack() {
    let out = run_probe(&["stack-overflow"]);
    assert_eq!(
        out.status.signal(),
        Some(libc::SIGSEGV),
        "stack overflow should still die by SIGSEGV, got {:?}",
        out.status
    );
    // The handler ran on the alternate stack and still got the message
    // out, even though the faulting thread's own stack was exhausted.
    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("caught unexpected signal 11"),
        "missing crash message after stack overflow in:\n{stderr}"
    );
}

#[test]
fn test_racing_faults_produce_one_report() {
    let out = run_probe(&["race"]);

    // Either thread may win the guard; the process dies by the winner's
    // re-raised signal.
    let signum = out.status.signal();
    assert!(
        signum == Some(libc::SIGSEGV) || signum == Some(libc::SIGFPE),
        "unexpected exit {:?}\nstderr:\n{}",
        out.status,
        stderr_of(&out)
    );

    let stderr = stderr_of(&out);
    let reports = stderr.matches("caught unexpected signal").count();
    assert_eq!(
        reports, 1,
        "exactly one thread may write the crash report, got {reports}:\n{stderr}"
    );
}

#[test]
fn test_explicit_crash_carries_context() {
    let out = run_probe(&["explicit"]);
    assert_eq!(out.status.signal(), Some(libc::SIGABRT));

    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("caught unexpected signal 6"),
        "explicit crash should funnel into the SIGABRT report:\n{stderr}"
    );
    assert!(
        stderr.contains("probe-requested crash"),
        "crash context missing from report:\n{stderr}"
    );
}

#[test]
fn test_log_filter_can_silence_report_but_not_death() {
    let out = Command::new(env!("CARGO_BIN_EXE_crashprobe"))
        .arg("null-deref")
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to spawn crashprobe");

    // Filtering the log away never interferes with the re-raise.
    assert_eq!(out.status.signal(), Some(libc::SIGSEGV));
    assert!(
        !stderr_of(&out).contains("caught unexpected signal"),
        "RUST_LOG=off should silence the crash report:\n{}",
        stderr_of(&out)
    );
}

#[test]
fn test_assertion_failure_reports_location() {
    let out = run_probe(&["assertion"]);
    assert_eq!(out.status.signal(), Some(libc::SIGABRT));

    let stderr = stderr_of(&out);
    assert!(
        stderr.contains("assertion failed"),
        "missing assertion report in:\n{stderr}"
    );
    assert!(
        stderr.contains("probe invariant"),
        "missing assertion expression in:\n{stderr}"
    );
}
