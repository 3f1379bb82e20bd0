//! # Handover
//!
//! Control passes to the kernel by calling the EFI stub's PE entry point with
//! the EFI calling convention:
//!
//! ```text
//! entry = kernel_base + AddressOfEntryPoint
//! entry(image_handle, system_table, kernel_base)
//! ```
//!
//! The image handle is the loader's own, so the stub finds its command line in
//! the loader's load options. A stub that boots never returns; a return means
//! the kernel refused to start and is reported as
//! [`BootError::HandoverDidNotExit`].

use crate::BootError;
use crate::addresses::PhysicalAddress;
use core::ffi::c_void;
use log::error;

/// Signature of the EFI stub entry point.
pub type EfiStubEntry = unsafe extern "efiapi" fn(*mut c_void, *mut c_void, *mut c_void);

/// Location of the EFI stub inside a loaded kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelEntry {
    base: PhysicalAddress,
    offset: u32,
}

impl KernelEntry {
    #[must_use]
    pub const fn new(base: PhysicalAddress, offset: u32) -> Self {
        Self { base, offset }
    }

    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn address(self) -> PhysicalAddress {
        self.base + u64::from(self.offset)
    }
}

/// Arguments passed to the EFI stub.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HandoverArguments {
    pub image_handle: *mut c_void,
    pub system_table: *mut c_void,
    pub kernel_base: *mut c_void,
}

/// Transfers control to a loaded kernel.
pub trait Handover {
    /// Calls the kernel entry. Returns only if the kernel returns.
    ///
    /// # Safety
    /// `entry` must be the EFI stub of a kernel image fully loaded at `entry.base()`,
    /// and everything the kernel reads (device tree, load options, ramdisk) must be in place.
    unsafe fn enter(&self, entry: KernelEntry, args: HandoverArguments);
}

/// Calls the entry point directly.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectJump;

impl Handover for DirectJump {
    unsafe fn enter(&self, entry: KernelEntry, args: HandoverArguments) {
        let Ok(address) = usize::try_from(entry.address().as_u64()) else {
            error!("Kernel entry {} is not addressable", entry.address());
            return;
        };
        let ptr = core::ptr::with_exposed_provenance::<()>(address);
        // SAFETY: The caller guarantees `ptr` is the stub entry of a loaded kernel.
        let stub = unsafe { core::mem::transmute::<*const (), EfiStubEntry>(ptr) };
        // SAFETY: As above.
        unsafe { stub(args.image_handle, args.system_table, args.kernel_base) };
    }
}

/// Hands over to the kernel and reports the return that should not happen.
///
/// # Safety
/// See [`Handover::enter`].
#[must_use]
pub unsafe fn execute<H: Handover + ?Sized>(
    handover: &H,
    entry: KernelEntry,
    args: HandoverArguments,
) -> BootError {
    // SAFETY: Forwarded to the caller.
    unsafe { handover.enter(entry, args) };
    error!("Kernel at {} returned to the loader", entry.address());
    BootError::HandoverDidNotExit
}
