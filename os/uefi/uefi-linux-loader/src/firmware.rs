//! Boot services behind the `linux-boot` firmware traits.

use crate::shim_lock;
use core::ffi::c_void;
use core::ptr::NonNull;
use linux_boot::addresses::PhysicalAddress;
use linux_boot::firmware::{
    AllocateRegion, BootContext, ConfigurationTables, FirmwareError, LoadOptions, MemoryKind,
    PageAllocator, PhysMapper, RawLoadOptions, VerifierLocator,
};
use linux_boot::secure_boot::Verification;
use log::debug;
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::{MemoryAttribute, MemoryMap};
use uefi::proto::loaded_image::LoadedImage;
use uefi::{Guid, Status, guid, system};

/// Configuration table entry of the flattened device tree.
pub const DEVICE_TREE_GUID: Guid = guid!("b1b621d5-f19c-41a5-830b-d9152c69aae0");

fn firmware_error(err: &uefi::Error) -> FirmwareError {
    match err.status() {
        Status::OUT_OF_RESOURCES => FirmwareError::OutOfResources,
        Status::NOT_FOUND => FirmwareError::NotFound,
        Status::UNSUPPORTED => FirmwareError::Unsupported,
        Status::INVALID_PARAMETER => FirmwareError::InvalidParameter,
        status => FirmwareError::Status(status.0),
    }
}

/// The running UEFI firmware, valid while boot services are active.
#[derive(Debug, Default, Copy, Clone)]
pub struct UefiFirmware;

impl PageAllocator for UefiFirmware {
    fn allocate_pages(
        &self,
        region: AllocateRegion,
        kind: MemoryKind,
        pages: usize,
    ) -> Result<PhysicalAddress, FirmwareError> {
        let ty = match region {
            AllocateRegion::Anywhere => AllocateType::AnyPages,
            AllocateRegion::Below(max) => AllocateType::MaxAddress(max.as_u64()),
        };
        let mem_ty = match kind {
            MemoryKind::Code => MemoryType::LOADER_CODE,
            MemoryKind::Data => MemoryType::LOADER_DATA,
        };
        let ptr = boot::allocate_pages(ty, mem_ty, pages).map_err(|e| firmware_error(&e))?;
        Ok(PhysicalAddress::from_ptr(ptr.as_ptr().cast_const()))
    }

    unsafe fn free_pages(&self, base: PhysicalAddress, pages: usize) -> Result<(), FirmwareError> {
        let ptr = NonNull::new(base.as_mut_ptr().cast::<u8>())
            .ok_or(FirmwareError::InvalidParameter)?;
        // SAFETY: The caller passes back one earlier allocation.
        unsafe { boot::free_pages(ptr, pages) }.map_err(|e| firmware_error(&e))
    }

    fn ram_base(&self) -> Result<PhysicalAddress, FirmwareError> {
        let map = boot::memory_map(MemoryType::LOADER_DATA).map_err(|e| firmware_error(&e))?;
        let base = map
            .entries()
            .filter(|desc| desc.att.contains(MemoryAttribute::WRITE_BACK))
            .map(|desc| desc.phys_start)
            .min()
            .ok_or(FirmwareError::NotFound)?;
        debug!("RAM base: {base:#x}");
        Ok(PhysicalAddress::new(base))
    }
}

impl PhysMapper for UefiFirmware {
    unsafe fn phys_to_slice_mut<'a>(&self, base: PhysicalAddress, len: usize) -> &'a mut [u8] {
        // SAFETY: Memory is identity mapped under boot services; ownership is the caller's contract.
        unsafe { core::slice::from_raw_parts_mut(base.as_mut_ptr().cast::<u8>(), len) }
    }
}

impl ConfigurationTables for UefiFirmware {
    fn device_tree(&self) -> Option<PhysicalAddress> {
        system::with_config_table(|table| {
            table
                .iter()
                .find(|entry| entry.guid == DEVICE_TREE_GUID)
                .map(|entry| PhysicalAddress::from_ptr(entry.address))
        })
    }

    unsafe fn install_device_tree(
        &self,
        table: Option<PhysicalAddress>,
    ) -> Result<(), FirmwareError> {
        let ptr = table.map_or(core::ptr::null(), |pa| pa.as_mut_ptr().cast_const());
        // SAFETY: The caller keeps the blob alive while installed; null removes the entry.
        unsafe { boot::install_configuration_table(&DEVICE_TREE_GUID, ptr) }
            .map_err(|e| firmware_error(&e))
    }
}

impl LoadOptions for UefiFirmware {
    fn load_options(&self) -> Result<RawLoadOptions, FirmwareError> {
        let image = boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle())
            .map_err(|e| firmware_error(&e))?;
        let Some(bytes) = image.load_options_as_bytes() else {
            return Ok(RawLoadOptions::default());
        };
        Ok(RawLoadOptions {
            address: PhysicalAddress::from_ptr(bytes.as_ptr()),
            size: u32::try_from(bytes.len()).map_err(|_| FirmwareError::InvalidParameter)?,
        })
    }

    unsafe fn set_load_options(&self, options: RawLoadOptions) -> Result<(), FirmwareError> {
        let mut image = boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle())
            .map_err(|e| firmware_error(&e))?;
        let ptr = options.address.as_mut_ptr().cast_const().cast::<u8>();
        // SAFETY: The caller keeps the buffer alive while installed.
        unsafe { image.set_load_options(ptr, options.size) };
        Ok(())
    }
}

impl VerifierLocator for UefiFirmware {
    fn locate_verifier(&self) -> Verification<'_> {
        shim_lock::locate()
    }
}

impl BootContext for UefiFirmware {
    fn image_handle(&self) -> *mut c_void {
        boot::image_handle().as_ptr()
    }

    fn system_table(&self) -> *mut c_void {
        uefi::table::system_table_raw().map_or(core::ptr::null_mut(), |st| st.as_ptr().cast())
    }
}
