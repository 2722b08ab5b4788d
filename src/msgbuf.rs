use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Hex digits for rendering addresses without `snprintf`, which is not
/// guaranteed async-signal-safe on all platforms.
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Fixed-capacity byte writer for assembling the crash message inside a
/// signal handler.
///
/// Appending never allocates and never fails: input that does not fit is
/// silently truncated. Only memory copies and table lookups are used, so
/// every method is async-signal-safe.
pub(crate) struct MsgBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> MsgBuf<N> {
    pub(crate) const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    /// Append raw bytes, truncating at capacity.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        let room = N - self.len;
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    pub(crate) fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Append an unsigned integer in decimal.
    pub(crate) fn push_u64(&mut self, mut value: u64) {
        // 20 digits hold u64::MAX; digits come out reversed.
        let mut digits = [0u8; 20];
        let mut n = 0;
        loop {
            digits[n] = b'0' + (value % 10) as u8;
            value /= 10;
            n += 1;
            if value == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.push_bytes(&[digits[n]]);
        }
    }

    /// Append an unsigned integer in lowercase hex, no leading zeros
    /// (a zero value renders as a single "0").
    pub(crate) fn push_hex(&mut self, value: u64) {
        let mut started = false;
        for shift in (0..16).rev() {
            let nibble = ((value >> (shift * 4)) & 0xf) as usize;
            if nibble != 0 || started || shift == 0 {
                self.push_bytes(&[HEX_DIGITS[nibble]]);
                started = true;
            }
        }
    }

    /// Bytes written so far.
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// View the assembled message. Everything appended so far came from
    /// `&str` literals, decimal digits, or the hex table, so the buffer is
    /// valid UTF-8 unless raw non-UTF-8 bytes were pushed; those render as
    /// a placeholder rather than risking any allocation here.
    pub(crate) fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8 crash message>")
    }
}

/// A fixed-size string slot writable during normal execution and readable
/// from a signal handler without allocation or locking.
///
/// Bytes are individually atomic and the length is published with Release
/// ordering after the bytes, so a handler that loads the length with
/// Acquire sees fully-written content. Writers are expected to be
/// serialized externally (the prepare path holds the crash guard).
pub(crate) struct StaticText<const N: usize> {
    bytes: [AtomicU8; N],
    len: AtomicUsize,
}

impl<const N: usize> StaticText<N> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const fn new() -> Self {
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            bytes: [ZERO; N],
            len: AtomicUsize::new(0),
        }
    }

    /// Store `text`, truncated to capacity. Last write wins.
    pub(crate) fn set(&self, text: &[u8]) {
        let n = text.len().min(N);
        for (slot, &b) in self.bytes.iter().zip(&text[..n]) {
            slot.store(b, Ordering::Relaxed);
        }
        self.len.store(n, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.len.store(0, Ordering::Release);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    /// Copy the stored bytes into `out`, returning the number copied.
    pub(crate) fn read_into(&self, out: &mut [u8]) -> usize {
        let n = self.len.load(Ordering::Acquire).min(out.len()).min(N);
        for (dst, slot) in out[..n].iter_mut().zip(&self.bytes) {
            *dst = slot.load(Ordering::Relaxed);
        }
        n
    }
}
