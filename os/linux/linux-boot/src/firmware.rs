//! # Firmware Services
//!
//! The boot-services surface the loader depends on, split by concern so that
//! each component names only what it uses. [`Firmware`] bundles all of them.
//!
//! All methods take `&self`: the firmware is a shared, single-threaded
//! environment and implementations keep whatever state they need internally.

use crate::addresses::PhysicalAddress;
use crate::secure_boot::Verification;
use core::ffi::c_void;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FirmwareError {
    #[error("out of resources")]
    OutOfResources,
    #[error("not found")]
    NotFound,
    #[error("unsupported")]
    Unsupported,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("firmware error (status {0:#x})")]
    Status(usize),
}

/// Where a page allocation may be placed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocateRegion {
    Anywhere,
    /// The last byte of the allocation must not exceed this address.
    Below(PhysicalAddress),
}

/// Memory type recorded in the firmware memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Code,
    Data,
}

pub trait PageAllocator {
    /// Allocates `pages` contiguous 4 KiB pages.
    ///
    /// # Errors
    /// [`FirmwareError::OutOfResources`] if no suitable range is free.
    fn allocate_pages(
        &self,
        region: AllocateRegion,
        kind: MemoryKind,
        pages: usize,
    ) -> Result<PhysicalAddress, FirmwareError>;

    /// Gives back pages obtained from [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Safety
    /// `base` and `pages` must describe exactly one earlier allocation that is no
    /// longer referenced.
    ///
    /// # Errors
    /// Whatever the firmware reports; the pages are leaked in that case.
    unsafe fn free_pages(&self, base: PhysicalAddress, pages: usize) -> Result<(), FirmwareError>;

    /// Lowest physical address of write-back capable RAM.
    ///
    /// # Errors
    /// [`FirmwareError::NotFound`] if the memory map has no such entry.
    fn ram_base(&self) -> Result<PhysicalAddress, FirmwareError>;
}

/// Byte access to physical memory.
pub trait PhysMapper {
    /// Returns the `len` bytes starting at `base`.
    ///
    /// # Safety
    /// The range must be mapped and owned by the caller for `'a`, and no other
    /// reference to it may exist.
    unsafe fn phys_to_slice_mut<'a>(&self, base: PhysicalAddress, len: usize) -> &'a mut [u8];
}

/// The device tree entry of the firmware configuration table.
pub trait ConfigurationTables {
    /// Address of the currently installed device tree, if any.
    fn device_tree(&self) -> Option<PhysicalAddress>;

    /// Installs `table` as the device tree, or removes the entry for `None`.
    ///
    /// # Safety
    /// `table` must point to a valid blob that stays alive while installed.
    ///
    /// # Errors
    /// Whatever the firmware reports.
    unsafe fn install_device_tree(&self, table: Option<PhysicalAddress>)
    -> Result<(), FirmwareError>;
}

/// Load options of the loader's own loaded-image record.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RawLoadOptions {
    pub address: PhysicalAddress,
    /// Size in bytes.
    pub size: u32,
}

pub trait LoadOptions {
    /// # Errors
    /// [`FirmwareError::NotFound`] if the loaded-image record cannot be located.
    fn load_options(&self) -> Result<RawLoadOptions, FirmwareError>;

    /// # Safety
    /// `options` must stay valid for as long as it is installed.
    ///
    /// # Errors
    /// [`FirmwareError::NotFound`] if the loaded-image record cannot be located.
    unsafe fn set_load_options(&self, options: RawLoadOptions) -> Result<(), FirmwareError>;
}

pub trait VerifierLocator {
    /// Looks up the signature verification service.
    fn locate_verifier(&self) -> Verification<'_>;
}

/// Pointers handed to the kernel's EFI stub.
pub trait BootContext {
    fn image_handle(&self) -> *mut c_void;
    fn system_table(&self) -> *mut c_void;
}

/// Everything the boot session needs from the firmware.
pub trait Firmware:
    PageAllocator + PhysMapper + ConfigurationTables + LoadOptions + VerifierLocator + BootContext
{
}

impl<T> Firmware for T where
    T: PageAllocator + PhysMapper + ConfigurationTables + LoadOptions + VerifierLocator + BootContext
{
}
