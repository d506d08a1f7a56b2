//! Output that never touches the allocator. Everything in here is safe to call
//! from inside `malloc()` and friends, which is where most of our diagnostics
//! come from.

use std::{fmt, io};

/// Write `bytes` to stderr with `write(2)`, retrying on `EINTR` and short
/// writes. Errors are dropped, there is nowhere left to report them.
pub fn putbytes(bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        // SAFETY: `rest` is a live slice, valid for `rest.len()` bytes of reads
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}

/// `puts`... but to stderr, and safe (doesn't use the allocator)
pub fn putstr(s: &str) {
    putbytes(s.as_bytes())
}

/// A fixed-capacity [`fmt::Write`] sink that lives on the stack. Anything that
/// does not fit is cut off rather than reallocated.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Truncation may split a code point, so fall back to the valid prefix
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: `valid_up_to()` bytes were just checked
                unsafe { std::str::from_utf8_unchecked(&self.buf[..valid]) }
            }
        }
    }

    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Write the buffer to stderr and empty it
    pub fn flush(&mut self) {
        putbytes(self.as_bytes());
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

/// `print!()` to stderr, without allocating. Long output is truncated at
/// 512 bytes.
#[macro_export]
macro_rules! put {
    ($($arg:tt)*) => {{
        let mut buf = $crate::util::print::StackBuf::<512>::new();
        let _ = ::core::fmt::Write::write_fmt(&mut buf, format_args!($($arg)*));
        buf.flush();
    }};
}

/// `eprintln!()`, without allocating
#[macro_export]
macro_rules! putln {
    ($($arg:tt)*) => {{
        let mut buf = $crate::util::print::StackBuf::<512>::new();
        let _ = ::core::fmt::Write::write_fmt(&mut buf, format_args!($($arg)*));
        let _ = ::core::fmt::Write::write_str(&mut buf, "\n");
        buf.flush();
    }};
}
