//! Kernel command line assembly.
//!
//! The command line is `BOOT_IMAGE=` followed by all arguments of the `linux`
//! command, the kernel path included, separated by single spaces. Arguments
//! containing a space are wrapped in double quotes, and `\`, `'` and `"` are
//! escaped with a backslash, so the kernel splits them back the same way.

use crate::BootError;
use alloc::string::String;
use core::fmt;

const BOOT_IMAGE_PREFIX: &str = "BOOT_IMAGE=";

const fn needs_escape(c: char) -> bool {
    matches!(c, '\\' | '\'' | '"')
}

/// Encoded length of one argument.
fn argument_len(arg: &str) -> usize {
    let escapes = arg.chars().filter(|&c| needs_escape(c)).count();
    let quotes = if arg.contains(' ') { 2 } else { 0 };
    arg.len() + escapes + quotes
}

fn push_argument(out: &mut String, arg: &str) {
    let quoted = arg.contains(' ');
    if quoted {
        out.push('"');
    }
    for c in arg.chars() {
        if needs_escape(c) {
            out.push('\\');
        }
        out.push(c);
    }
    if quoted {
        out.push('"');
    }
}

/// A NUL-terminated kernel command line.
#[derive(Clone, Eq, PartialEq)]
pub struct BootCommandLine {
    /// Text followed by a single NUL.
    text: String,
}

impl BootCommandLine {
    /// Builds `BOOT_IMAGE=<args…>` into a buffer of exactly the required size.
    ///
    /// # Errors
    /// [`BootError::OutOfMemory`] if the buffer cannot be allocated.
    pub fn assemble<S: AsRef<str>>(args: &[S]) -> Result<Self, BootError> {
        let separators = args.len().saturating_sub(1);
        let len = BOOT_IMAGE_PREFIX.len()
            + args.iter().map(|a| argument_len(a.as_ref())).sum::<usize>()
            + separators
            + 1;

        let mut text = String::new();
        text.try_reserve_exact(len)
            .map_err(|_| BootError::OutOfMemory)?;

        text.push_str(BOOT_IMAGE_PREFIX);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                text.push(' ');
            }
            push_argument(&mut text, arg.as_ref());
        }
        text.push('\0');
        debug_assert_eq!(text.len(), len);

        Ok(Self { text })
    }

    /// The command line without its terminator.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text[..self.text.len() - 1]
    }

    /// The command line including its terminator.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// UTF-16 code units of the command line, terminator included.
    pub fn encode_utf16_with_nul(&self) -> impl Iterator<Item = u16> + '_ {
        self.text.encode_utf16()
    }
}

impl fmt::Display for BootCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for BootCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
