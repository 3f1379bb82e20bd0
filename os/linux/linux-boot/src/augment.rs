//! # Device Tree Augmentation
//!
//! Before the handover the firmware's device tree is copied into a fresh buffer
//! with [`FDT_EXTRA_SPACE`] bytes of headroom, the `/chosen` node is created if
//! needed and the ramdisk location is recorded in it:
//!
//! ```text
//! / {
//!     chosen {
//!         linux,initrd-start = <u64 BE>;   // first byte of the ramdisk
//!         linux,initrd-end   = <u64 BE>;   // one past the last byte
//!     };
//! };
//! ```
//!
//! The copy is then installed as the device tree configuration table, where the
//! kernel's EFI stub picks it up. If the firmware has no device tree, an empty
//! one is created.
//!
//! The installed copy is owned by an [`InstalledDeviceTree`]. Dropping it puts
//! the firmware's previous table back and frees the copy.

use crate::BootError;
use crate::addresses::PhysicalAddress;
use crate::firmware::{Firmware, MemoryKind};
use crate::placement::{PageAllocation, allocate_anywhere};
use linux_fdt::{DeviceTree, EMPTY_TREE_SIZE, FdtError, Node};
use log::{debug, warn};

/// Headroom added to the firmware tree for the properties the loader sets.
pub const FDT_EXTRA_SPACE: usize = 0x400;

/// Bytes needed to read the `totalsize` field of a tree header.
const FDT_HEADER_PROBE: usize = 40;

/// Physical extent of the loaded ramdisk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RamdiskSpan {
    pub start: PhysicalAddress,
    /// One past the last byte.
    pub end: PhysicalAddress,
}

/// A device tree installed for the kernel.
#[must_use = "dropping the guard uninstalls the device tree"]
pub struct InstalledDeviceTree<'fw, F: Firmware + ?Sized> {
    firmware: &'fw F,
    previous: Option<PhysicalAddress>,
    installed: bool,
    allocation: PageAllocation<'fw, F>,
}

impl<F: Firmware + ?Sized> InstalledDeviceTree<'_, F> {
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.allocation.base()
    }
}

impl<F: Firmware + ?Sized> Drop for InstalledDeviceTree<'_, F> {
    fn drop(&mut self) {
        if !self.installed {
            return;
        }
        // SAFETY: `previous` is the table the firmware had before ours, still owned by it.
        if let Err(e) = unsafe { self.firmware.install_device_tree(self.previous) } {
            warn!("Failed to restore the firmware device tree: {e}");
        }
    }
}

/// Copies, amends and installs the device tree.
///
/// # Errors
/// [`BootError::FirmwareConfigFailure`] on any failure; nothing stays installed or allocated.
pub fn augment_device_tree<F: Firmware + ?Sized>(
    firmware: &F,
    ramdisk: Option<RamdiskSpan>,
) -> Result<InstalledDeviceTree<'_, F>, BootError> {
    let previous = firmware.device_tree();
    let source_size = match previous {
        Some(table) => {
            // SAFETY: The firmware keeps its installed tree mapped.
            let header = unsafe { firmware.phys_to_slice_mut(table, FDT_HEADER_PROBE) };
            linux_fdt::total_size(header).map_err(fdt_failure)?
        }
        None => EMPTY_TREE_SIZE,
    };
    let size = source_size
        .checked_add(FDT_EXTRA_SPACE)
        .ok_or(BootError::FirmwareConfigFailure)?;

    let allocation = allocate_anywhere(firmware, MemoryKind::Data, size)
        .map_err(|_| BootError::FirmwareConfigFailure)?;

    let mut guard = InstalledDeviceTree {
        firmware,
        previous,
        installed: false,
        allocation,
    };

    // SAFETY: The allocation is ours and at least `size` bytes long.
    let blob = unsafe { firmware.phys_to_slice_mut(guard.address(), size) };
    let tree = match previous {
        Some(table) => {
            // SAFETY: As above; the firmware tree and our copy do not overlap.
            let source = unsafe { firmware.phys_to_slice_mut(table, source_size) };
            blob[..source_size].copy_from_slice(source);
            copy_tree(blob, size)
        }
        None => linux_fdt::create_empty_tree(blob),
    };
    let mut tree = tree.map_err(fdt_failure)?;

    set_chosen(&mut tree, ramdisk).map_err(fdt_failure)?;

    // SAFETY: The blob is a valid tree and lives as long as the guard.
    if let Err(e) = unsafe { firmware.install_device_tree(Some(guard.address())) } {
        warn!("Failed to install the device tree configuration table: {e}");
        return Err(BootError::FirmwareConfigFailure);
    }
    guard.installed = true;

    debug!(
        "Installed/updated FDT configuration table @ {}",
        guard.address()
    );
    Ok(guard)
}

fn copy_tree(blob: &mut [u8], size: usize) -> Result<DeviceTree<'_>, FdtError> {
    let mut tree = DeviceTree::from_blob(blob)?;
    tree.set_total_size(size)?;
    Ok(tree)
}

fn set_chosen(tree: &mut DeviceTree<'_>, ramdisk: Option<RamdiskSpan>) -> Result<(), FdtError> {
    let chosen = match tree.find_subnode(Node::ROOT, "chosen")? {
        Some(node) => node,
        None => tree.add_subnode(Node::ROOT, "chosen")?,
    };
    if chosen.offset() < 1 {
        return Err(FdtError::BadOffset);
    }

    if let Some(RamdiskSpan { start, end }) = ramdisk
        && end > start
    {
        debug!("Initrd @ {start}-{end}");
        tree.set_property_u64(chosen, "linux,initrd-start", start.as_u64())?;
        tree.set_property_u64(chosen, "linux,initrd-end", end.as_u64())?;
    }
    Ok(())
}

fn fdt_failure(e: FdtError) -> BootError {
    warn!("Device tree update failed: {e}");
    BootError::FirmwareConfigFailure
}
