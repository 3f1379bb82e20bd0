//! # Linux EFI-Stub Boot Core
//!
//! Loads an ARM or ARM64 Linux kernel that carries an EFI stub, optionally
//! places one or more initial ramdisks next to it, attaches the boot metadata
//! the stub expects and finally jumps into the stub.
//!
//! ## Flow
//!
//! ```text
//! linux  <path> [args…]   Image Validator → Secure-Boot Gate → Placement (anywhere)
//!                         → command line assembly                 → KernelLoaded
//! initrd <path> [path…]   Ramdisk aggregation → Placement (below RAM base + window)
//! boot                    FDT augmentation → load options install → handover
//! unload                  release everything                      → Idle
//! ```
//!
//! ## Firmware Seams
//!
//! Everything firmware-specific is reached through the traits in [`firmware`]
//! and [`file`]. The UEFI application implements them on top of boot services;
//! the unit tests implement them on top of simulated physical memory.
//!
//! ## Resource Discipline
//!
//! Every firmware resource is held by a guard that gives it back on drop:
//!
//! | Resource                    | Guard                                  |
//! |-----------------------------|----------------------------------------|
//! | page allocations            | [`placement::PageAllocation`]          |
//! | installed device tree       | [`augment::InstalledDeviceTree`]       |
//! | replaced load options       | [`marshal::InstalledLoadOptions`]      |
//! | module reference            | [`module::ModulePin`]                  |
//!
//! A failing command therefore releases exactly what it acquired, and nothing
//! that an earlier command left behind.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]
extern crate alloc;

pub mod addresses;
pub mod augment;
pub mod cmdline;
mod error;
pub mod file;
pub mod firmware;
pub mod handover;
pub mod marshal;
pub mod module;
pub mod placement;
pub mod ramdisk;
pub mod script;
pub mod secure_boot;
pub mod session;

#[cfg(test)]
mod test_support;

pub use error::BootError;
pub use session::{BootLoadSession, SessionState};
