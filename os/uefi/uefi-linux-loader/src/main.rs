//! # UEFI Linux Loader for ARM and AArch64
//!
//! Boots an EFI-stub Linux kernel the way GRUB's `linux` loader does: the
//! kernel and ramdisk are read from the loader's own volume, the device tree is
//! augmented with the ramdisk location, the command line becomes the loader's
//! load options, and the kernel's PE entry point is called with the loader's
//! image handle and system table.
//!
//! ```text
//! UEFI Firmware
//!         ↓
//! ┌──────────────────────────────────────────────┐
//! │  1. Logging and allocator                    │
//! │  2. Boot script                              │
//! │     • load options, or \EFI\Boot\linux.cfg   │
//! │  3. linux /Image args...                     │
//! │     • validate, verify (shim), place         │
//! │  4. initrd /initrd.img...                    │
//! │     • place below RAM base + window          │
//! │  5. boot                                     │
//! │     • /chosen, load options, entry call      │
//! └──────────────────────────────────────────────┘
//!         ↓
//! Linux EFI stub
//! ```
//!
//! Boot services are never exited here; the kernel's EFI stub does that.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod config;
mod file_system;
mod firmware;
mod logger;
mod shim_lock;

use crate::file_system::EspFiles;
use crate::firmware::UefiFirmware;
use crate::logger::UefiLogger;
use alloc::string::String;
use alloc::vec;
use linux_boot::file::{BootFile, FileError, FileSource, read_fully};
use linux_boot::handover::{DirectJump, Handover, HandoverArguments, KernelEntry};
use linux_boot::marshal::read_load_options;
use linux_boot::module::ModuleRefCount;
use linux_boot::script::{self, ScriptError};
use linux_boot::{BootError, BootLoadSession};
use linux_image::Architecture;
use log::{error, info, warn};
use uefi::prelude::*;

static LOGGER: UefiLogger = UefiLogger::new(config::LOG_LEVEL);

/// Pinned while a kernel is loaded.
static MODULE: ModuleRefCount = ModuleRefCount::new();

/// Jumps to the kernel with console logging muted.
struct MutedJump<'l> {
    logger: &'l UefiLogger,
}

impl Handover for MutedJump<'_> {
    unsafe fn enter(&self, entry: KernelEntry, args: HandoverArguments) {
        self.logger.mute();
        // SAFETY: Forwarded to the caller.
        unsafe { DirectJump.enter(entry, args) };
        self.logger.unmute();
    }
}

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }
    if LOGGER.init().is_err() {
        return Status::UNSUPPORTED;
    }

    info!("Linux loader for {:?}", Architecture::NATIVE);
    let firmware = UefiFirmware;
    let files = EspFiles;

    let script = match boot_script(&firmware, &files) {
        Ok(script) => script,
        Err(status) => return status,
    };

    let mut session = BootLoadSession::new(&firmware, &MODULE);
    let handover = MutedJump { logger: &LOGGER };
    match script::run(&mut session, &files, &handover, &script) {
        Ok(()) => {
            warn!("Boot script ended without booting a kernel");
            Status::ABORTED
        }
        Err(e) => {
            error!("{e}");
            script_status(&e)
        }
    }
}

/// The loader's own load options if they hold anything, else the script file.
fn boot_script(firmware: &UefiFirmware, files: &EspFiles) -> Result<String, Status> {
    match read_load_options(firmware) {
        Ok(Some(options)) => {
            let script = strip_image_name(&options);
            if !script.trim().is_empty() {
                info!("Using load options as boot script");
                return Ok(script.into());
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Cannot read load options: {e}"),
    }

    info!("Reading boot script {}", config::SCRIPT_PATH);
    read_script_file(files).map_err(|e| {
        error!("{e}");
        boot_status(&BootError::File(e))
    })
}

/// Drops the leading `*.efi` word a shell puts in front of the arguments.
fn strip_image_name(options: &str) -> &str {
    let trimmed = options.trim_start();
    let (first, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    if first
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("efi"))
    {
        rest
    } else {
        options
    }
}

fn read_script_file(files: &EspFiles) -> Result<String, FileError> {
    let mut file = files.open(config::SCRIPT_PATH)?;
    let size = usize::try_from(file.size())
        .map_err(|_| FileError::Io(config::SCRIPT_PATH.into()))?;
    let mut buf = vec![0u8; size];
    let read = read_fully(&mut file, &mut buf)?;
    buf.truncate(read);
    String::from_utf8(buf).map_err(|_| FileError::Io(config::SCRIPT_PATH.into()))
}

fn script_status(err: &ScriptError) -> Status {
    match err {
        ScriptError::UnknownCommand { .. } | ScriptError::UnterminatedQuote { .. } => {
            Status::INVALID_PARAMETER
        }
        ScriptError::Boot { source, .. } => boot_status(source),
    }
}

fn boot_status(err: &BootError) -> Status {
    match err {
        BootError::BadFormat(_) | BootError::UnsupportedBuild | BootError::HandoverDidNotExit => {
            Status::LOAD_ERROR
        }
        BootError::SignatureInvalid { .. } => Status::SECURITY_VIOLATION,
        BootError::OutOfMemory => Status::OUT_OF_RESOURCES,
        BootError::FirmwareConfigFailure
        | BootError::ParameterInstallFailure
        | BootError::File(FileError::Io(_)) => Status::DEVICE_ERROR,
        BootError::PrerequisiteNotLoaded => Status::NOT_READY,
        BootError::TruncatedRead { .. } => Status::END_OF_FILE,
        BootError::FilenameExpected
        | BootError::File(FileError::BadPath(_) | FileError::NotRegularFile(_)) => {
            Status::INVALID_PARAMETER
        }
        BootError::File(FileError::NotFound(_)) => Status::NOT_FOUND,
    }
}
