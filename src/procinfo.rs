//! Process introspection for the crash summary line: resident/virtual
//! memory, thread count, and available physical memory.
//!
//! Reads `/proc` with raw file descriptors into fixed buffers and parses
//! integers by hand, so the collection path stays allocation-free and
//! usable from the signal handler.

/// Snapshot of process resource usage at crash time. Fields the platform
/// cannot provide are zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub thread_count: u64,
    pub available_bytes: u64,
}

#[cfg(target_os = "linux")]
pub(crate) fn collect() -> ProcessStats {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    };

    let mut stats = ProcessStats::default();

    // Buffers are sized for the fields actually parsed, not whole files:
    // the handler may be running on a small per-thread alternate stack.
    let mut statm = [0u8; 128];
    let n = read_proc(b"/proc/self/statm\0", &mut statm);
    let (virt_pages, res_pages) = parse_statm(&statm[..n]);
    stats.virtual_bytes = virt_pages * page;
    stats.resident_bytes = res_pages * page;

    let mut status = [0u8; 2048];
    let n = read_proc(b"/proc/self/status\0", &mut status);
    stats.thread_count = value_after(&status[..n], b"Threads:");

    // MemAvailable sits in the first few lines of /proc/meminfo.
    let mut meminfo = [0u8; 512];
    let n = read_proc(b"/proc/meminfo\0", &mut meminfo);
    stats.available_bytes = value_after(&meminfo[..n], b"MemAvailable:") * 1024;

    stats
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn collect() -> ProcessStats {
    ProcessStats::default()
}

/// Read a NUL-terminated `/proc` path into `buf`. Returns bytes read
/// (0 on any failure). Async-signal-safe: open/read/close only.
#[cfg(target_os = "linux")]
fn read_proc(path: &[u8], buf: &mut [u8]) -> usize {
    debug_assert_eq!(path.last(), Some(&0));
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        return 0;
    }
    let n = read_fd(fd, buf);
    unsafe { libc::close(fd) };
    n
}

/// Fill `buf` from `fd`, retrying on EINTR. Returns bytes read.
pub(crate) fn read_fd(fd: libc::c_int, buf: &mut [u8]) -> usize {
    let mut total = 0;
    while total < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            )
        };
        if n < 0 {
            if nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            break;
        }
        if n == 0 {
            break;
        }
        total += n as usize;
    }
    total
}

/// Parse the first two whitespace-separated integers of `/proc/self/statm`
/// (total program size and resident set size, in pages).
fn parse_statm(buf: &[u8]) -> (u64, u64) {
    let mut fields = [0u64; 2];
    let mut idx = 0;
    let mut pos = 0;
    while idx < fields.len() {
        let (value, next) = parse_u64(buf, pos);
        if next == pos {
            break;
        }
        fields[idx] = value;
        idx += 1;
        pos = skip_non_digits(buf, next);
    }
    (fields[0], fields[1])
}

/// Find `key` in `buf` and parse the first integer after it on the same
/// line. Returns 0 if the key is absent.
fn value_after(buf: &[u8], key: &[u8]) -> u64 {
    let mut start = 0;
    while start + key.len() <= buf.len() {
        if &buf[start..start + key.len()] == key {
            let pos = skip_non_digits(buf, start + key.len());
            let (value, _) = parse_u64(buf, pos);
            return value;
        }
        // Keys are line-anchored in /proc; jump to the next line.
        match buf[start..].iter().position(|&b| b == b'\n') {
            Some(nl) => start += nl + 1,
            None => break,
        }
    }
    0
}

/// Parse a decimal integer at `pos`. Returns (value, position after the
/// last digit); position unchanged means no digits were found.
fn parse_u64(buf: &[u8], mut pos: usize) -> (u64, usize) {
    let mut value = 0u64;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add(u64::from(buf[pos] - b'0'));
        pos += 1;
    }
    (value, pos)
}

/// Advance past spaces/tabs (stops at digits or line end content).
fn skip_non_digits(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && !buf[pos].is_ascii_digit() && buf[pos] != b'\n' {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statm_fields() {
        let sample = b"48559 10290 7408 1543 0 4128 0\n";
        assert_eq!(parse_statm(sample), (48559, 10290));
    }

    #[test]
    fn test_parse_statm_garbage_is_zero() {
        assert_eq!(parse_statm(b""), (0, 0));
        assert_eq!(parse_statm(b"not numbers\n"), (0, 0));
    }

    #[test]
    fn test_value_after_finds_line_anchored_key() {
        let sample = b"Name:\tcrashprobe\nVmRSS:\t   41160 kB\nThreads:\t3\n";
        assert_eq!(value_after(sample, b"Threads:"), 3);
        assert_eq!(value_after(sample, b"VmRSS:"), 41160);
        assert_eq!(value_after(sample, b"Missing:"), 0);
    }

    #[test]
    fn test_value_after_meminfo() {
        let sample = b"MemTotal:       16316412 kB\nMemFree:         1655852 kB\nMemAvailable:    8539520 kB\n";
        assert_eq!(value_after(sample, b"MemAvailable:"), 8539520);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_collect_reports_live_process() {
        let stats = collect();
        assert!(stats.resident_bytes > 0);
        assert!(stats.virtual_bytes >= stats.resident_bytes);
        assert!(stats.thread_count >= 1);
    }
}
