//! # Boot Scripts
//!
//! A minimal command language driving a [`BootLoadSession`]:
//!
//! ```text
//! # comment
//! linux /Image root=/dev/vda2 "dyndbg=file x.c +p"
//! initrd /initrd.img; boot
//! ```
//!
//! Commands end at a newline or `;`. Arguments are separated by blanks; double
//! quotes group blanks into one argument and a backslash takes the next
//! character literally. `#` at the start of a word comments out the rest of the
//! line.
//!
//! | Command                | Action                                     |
//! |------------------------|--------------------------------------------|
//! | `linux`, `linuxefi`    | [`BootLoadSession::load_kernel`]           |
//! | `initrd`, `initrdefi`  | [`BootLoadSession::load_ramdisk`]          |
//! | `boot`                 | [`BootLoadSession::boot`]                  |
//! | `unload`               | [`BootLoadSession::unload`]                |
//!
//! Execution stops at the first failing command.

use crate::BootError;
use crate::file::FileSource;
use crate::firmware::Firmware;
use crate::handover::Handover;
use crate::session::BootLoadSession;
use alloc::string::String;
use alloc::vec::Vec;
use log::{info, warn};

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: unknown command `{name}'")]
    UnknownCommand { line: usize, name: String },
    #[error("line {line}: unterminated quote")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: {source}")]
    Boot { line: usize, source: BootError },
}

/// One command of a script with its words, the command name first.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScriptCommand {
    /// 1-based line number.
    pub line: usize,
    pub words: Vec<String>,
}

impl ScriptCommand {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.words[0]
    }

    #[must_use]
    pub fn args(&self) -> Vec<&str> {
        self.words[1..].iter().map(String::as_str).collect()
    }
}

/// Splits `script` into commands.
///
/// # Errors
/// [`ScriptError::UnterminatedQuote`] if a quote is still open at the end of a line.
pub fn parse(script: &str) -> Result<Vec<ScriptCommand>, ScriptError> {
    let mut commands = Vec::new();
    for (index, text) in script.lines().enumerate() {
        let line = index + 1;
        let mut words = Vec::new();
        let mut word = String::new();
        let mut in_word = false;
        let mut quoted = false;
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        word.push(next);
                    }
                    in_word = true;
                }
                '"' => {
                    quoted = !quoted;
                    in_word = true;
                }
                c if quoted => word.push(c),
                '#' if !in_word => break,
                ' ' | '\t' | ';' => {
                    if in_word {
                        words.push(core::mem::take(&mut word));
                        in_word = false;
                    }
                    if c == ';' && !words.is_empty() {
                        commands.push(ScriptCommand {
                            line,
                            words: core::mem::take(&mut words),
                        });
                    }
                }
                c => {
                    word.push(c);
                    in_word = true;
                }
            }
        }

        if quoted {
            return Err(ScriptError::UnterminatedQuote { line });
        }
        if in_word {
            words.push(word);
        }
        if !words.is_empty() {
            commands.push(ScriptCommand { line, words });
        }
    }
    Ok(commands)
}

/// Parses and runs `script` against `session`.
///
/// Returns once the script is exhausted; a successful `boot` does not return.
///
/// # Errors
/// The first parse error, unknown command, or failing command.
pub fn run<F, S, H>(
    session: &mut BootLoadSession<'_, F>,
    files: &S,
    handover: &H,
    script: &str,
) -> Result<(), ScriptError>
where
    F: Firmware + ?Sized,
    S: FileSource + ?Sized,
    H: Handover + ?Sized,
{
    for command in parse(script)? {
        let line = command.line;
        let args = command.args();
        info!("> {}", command.words.join(" "));

        let result = match command.name() {
            "linux" | "linuxefi" => session.load_kernel(files, args.as_slice()),
            "initrd" | "initrdefi" => session.load_ramdisk(files, args.as_slice()),
            "boot" => session.boot(handover).map(|never| match never {}),
            "unload" => {
                session.unload();
                Ok(())
            }
            name => {
                warn!("line {line}: unknown command `{name}'");
                return Err(ScriptError::UnknownCommand {
                    line,
                    name: name.into(),
                });
            }
        };

        if let Err(source) = result {
            warn!("line {line}: {source}");
            return Err(ScriptError::Boot { line, source });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionState;
    use crate::module::ModuleRefCount;
    use crate::test_support::{FakeFiles, FakeFirmware, GIB, RecordingHandover, test_kernel};
    use linux_image::Architecture;

    fn words(commands: &[ScriptCommand]) -> Vec<Vec<&str>> {
        commands
            .iter()
            .map(|c| c.words.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn splits_lines_and_semicolons() {
        let commands = parse("linux /Image quiet\ninitrd /a /b; boot\n\n").unwrap();
        assert_eq!(
            words(&commands),
            [
                vec!["linux", "/Image", "quiet"],
                vec!["initrd", "/a", "/b"],
                vec!["boot"],
            ]
        );
        assert_eq!(commands[2].line, 2);
    }

    #[test]
    fn quotes_escapes_and_comments() {
        let commands =
            parse("# header\nlinux /Image \"a b\" c\\ d x#y \"\" # trailing").unwrap();
        assert_eq!(
            words(&commands),
            [vec!["linux", "/Image", "a b", "c d", "x#y", ""]]
        );
        assert_eq!(commands[0].line, 2);
    }

    #[test]
    fn quoted_semicolon_is_literal() {
        let commands = parse("linux /Image \"a;b\"").unwrap();
        assert_eq!(words(&commands), [vec!["linux", "/Image", "a;b"]]);
    }

    #[test]
    fn open_quote_is_an_error() {
        assert_eq!(
            parse("linux\nlinux /Image \"oops").err(),
            Some(ScriptError::UnterminatedQuote { line: 2 })
        );
    }

    #[test]
    fn runs_until_boot() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, 4 * GIB);
        let module = ModuleRefCount::new();
        let files = FakeFiles::new()
            .with_file("/Image", test_kernel(Architecture::Arm64, 1 << 20, 0x800))
            .with_file("/initrd.img", vec![7; 5000]);
        let mut session = BootLoadSession::for_architecture(&fw, &module, Architecture::Arm64);
        let handover = RecordingHandover::new(&fw);

        let result = run(
            &mut session,
            &files,
            &handover,
            "linuxefi /Image console=ttyAMA0 \"x y\"\ninitrdefi /initrd.img\nboot\n",
        );

        assert_eq!(
            result,
            Err(ScriptError::Boot {
                line: 3,
                source: BootError::HandoverDidNotExit
            })
        );
        let seen = handover.seen().unwrap();
        assert_eq!(
            seen.cmdline.as_deref(),
            Some("BOOT_IMAGE=/Image console=ttyAMA0 \"x y\"")
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn stops_at_the_first_failure() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, 4 * GIB);
        let module = ModuleRefCount::new();
        let files = FakeFiles::new();
        let mut session = BootLoadSession::for_architecture(&fw, &module, Architecture::Arm64);
        let handover = RecordingHandover::new(&fw);

        let result = run(&mut session, &files, &handover, "initrd /a\nboot");
        assert_eq!(
            result,
            Err(ScriptError::Boot {
                line: 1,
                source: BootError::PrerequisiteNotLoaded
            })
        );
        assert!(handover.seen().is_none());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let fw = FakeFirmware::new();
        let module = ModuleRefCount::new();
        let mut session = BootLoadSession::for_architecture(&fw, &module, Architecture::Arm64);
        let handover = RecordingHandover::new(&fw);
        assert_eq!(
            run(&mut session, &FakeFiles::new(), &handover, "unload\nchainloader /x"),
            Err(ScriptError::UnknownCommand {
                line: 2,
                name: "chainloader".into()
            })
        );
    }

    #[test]
    fn script_without_boot_keeps_the_kernel() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, 4 * GIB);
        let module = ModuleRefCount::new();
        let files = FakeFiles::new()
            .with_file("/Image", test_kernel(Architecture::Arm64, 1 << 16, 0x800));
        let mut session = BootLoadSession::for_architecture(&fw, &module, Architecture::Arm64);
        let handover = RecordingHandover::new(&fw);
        run(&mut session, &files, &handover, "linux /Image").unwrap();
        assert_eq!(session.state(), SessionState::KernelLoaded);
    }
}
