use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::guard::GUARD;
use crate::msgbuf::StaticText;

/// Precomputed path the signal handler writes the raw backtrace into.
/// Empty means "skip file-based reporting". Held as a fixed static buffer
/// so the handler can read it without allocating.
static CRASH_FILENAME: StaticText<1024> = StaticText::new();

/// Precompute the crash-file path, outside of any signal context.
///
/// Takes the crash guard for its duration so a crash racing against
/// startup cannot observe a half-written filename; the guard is reset on
/// exit (the only path that ever resets it). Any failure degrades to "no
/// crash file" without surfacing an error. Calling again overwrites the
/// previous result.
pub(crate) fn prepare() {
    if !GUARD.try_acquire() {
        // A crash is already in flight; it owns the process now.
        return;
    }
    match mint_temp_path() {
        Ok(path) => {
            CRASH_FILENAME.set(path.as_os_str().as_bytes());
            tracing::debug!(target: "crash", path = %path.display(), "crash backtrace file prepared");
        }
        Err(err) => {
            CRASH_FILENAME.clear();
            tracing::warn!(target: "crash", %err, "could not prepare crash backtrace file, file-based reporting disabled");
        }
    }
    GUARD.reset();
}

/// Copy the prepared path into `out`, returning its length (0 = no file).
pub(crate) fn read_into(out: &mut [u8]) -> usize {
    CRASH_FILENAME.read_into(out)
}

/// Mint a unique temp path for the crash file.
///
/// The temp file is created to reserve a unique name, then removed so the
/// handler's exclusive-create open can succeed. A third party grabbing
/// the name in between makes that open fail, which the handler treats as
/// "skip file output" — acceptable for a diagnostic artifact.
fn mint_temp_path() -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("crash-backtrace-")
        .suffix(".log")
        .tempfile()?;
    let temp_path = file.into_temp_path();
    let path = temp_path.to_path_buf();
    temp_path.close()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_temp_path_is_unique_and_unoccupied() {
        let a = mint_temp_path().unwrap();
        let b = mint_temp_path().unwrap();
        assert_ne!(a, b);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("crash-backtrace-"));
    }

    // Single test so the global guard and filename slot are exercised
    // sequentially; the test harness runs separate tests in parallel.
    #[test]
    fn test_prepare_idempotent_and_guard_aware() {
        prepare();
        let mut buf = [0u8; 1024];
        let n = read_into(&mut buf);
        assert!(n > 0);

        // Calling again never crashes; last successful result wins.
        prepare();
        let n = read_into(&mut buf);
        assert!(n > 0);
        let second = buf[..n].to_vec();

        // While the guard is held (crash in flight), prepare backs off and
        // leaves the previous filename intact.
        assert!(GUARD.try_acquire());
        prepare();
        let n = read_into(&mut buf);
        assert_eq!(&buf[..n], &second[..]);
        GUARD.reset();
    }
}
