//! # Placement Allocator
//!
//! Two placement policies on top of [`PageAllocator`]:
//!
//! * **anywhere**, for the kernel image and boot metadata;
//! * **windowed**, for the initial ramdisk, which has to lie within a fixed
//!   window above the start of RAM:
//!
//! ```text
//! ram_base                                   ram_base + window
//!    │◄──────────────── window ────────────────►│
//!    ├──────────────────────────────┬───────────┤
//!    │                              │  ramdisk  │ last byte ≤ ram_base + window − 1
//!    └──────────────────────────────┴───────────┘
//! ```
//!
//! ARM kernels need the ramdisk inside the linear mapping, so the window is the
//! first 512 MiB of RAM. ARM64 kernels need it inside a 32 GiB window that also
//! covers the kernel, which the stub places near the start of RAM.
//!
//! Every grant is returned as a [`PageAllocation`] that frees exactly the pages
//! it was given when dropped.

use crate::BootError;
use crate::addresses::{PAGE_SIZE, PhysicalAddress, bytes_to_pages};
use crate::firmware::{AllocateRegion, MemoryKind, PageAllocator};
use linux_image::Architecture;
use log::{debug, warn};

/// Ramdisk window on 32-bit ARM.
pub const ARM_RAMDISK_WINDOW: u64 = 512 * 1024 * 1024;

/// Ramdisk window on ARM64.
pub const ARM64_RAMDISK_WINDOW: u64 = 32 * 1024 * 1024 * 1024;

#[must_use]
pub const fn ramdisk_window(architecture: Architecture) -> u64 {
    match architecture {
        Architecture::Arm => ARM_RAMDISK_WINDOW,
        Architecture::Arm64 => ARM64_RAMDISK_WINDOW,
    }
}

/// Pages owned by the holder, freed on drop.
#[must_use = "dropping the allocation frees it"]
pub struct PageAllocation<'fw, A: PageAllocator + ?Sized> {
    allocator: &'fw A,
    base: PhysicalAddress,
    pages: usize,
}

impl<'fw, A: PageAllocator + ?Sized> PageAllocation<'fw, A> {
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Address of the last byte in the allocation.
    #[must_use]
    pub const fn last_byte(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + (self.len() as u64) - 1)
    }
}

impl<A: PageAllocator + ?Sized> Drop for PageAllocation<'_, A> {
    fn drop(&mut self) {
        // SAFETY: The allocation is owned by this guard and handed out nowhere else.
        if let Err(e) = unsafe { self.allocator.free_pages(self.base, self.pages) } {
            warn!(
                "Failed to free {} pages at {}: {e}",
                self.pages, self.base
            );
        }
    }
}

fn allocate<'fw, A: PageAllocator + ?Sized>(
    allocator: &'fw A,
    region: AllocateRegion,
    kind: MemoryKind,
    bytes: usize,
) -> Result<PageAllocation<'fw, A>, BootError> {
    let pages = bytes_to_pages(bytes).max(1);
    match allocator.allocate_pages(region, kind, pages) {
        Ok(base) => Ok(PageAllocation {
            allocator,
            base,
            pages,
        }),
        Err(e) => {
            warn!("Failed to allocate {pages} pages ({region:?}): {e}");
            Err(BootError::OutOfMemory)
        }
    }
}

/// Allocates pages for `bytes` without placement constraints.
///
/// # Errors
/// [`BootError::OutOfMemory`] if the firmware cannot satisfy the request.
pub fn allocate_anywhere<A: PageAllocator + ?Sized>(
    allocator: &A,
    kind: MemoryKind,
    bytes: usize,
) -> Result<PageAllocation<'_, A>, BootError> {
    allocate(allocator, AllocateRegion::Anywhere, kind, bytes)
}

/// Allocates data pages for `bytes` entirely inside the ramdisk window of `architecture`.
///
/// # Errors
/// [`BootError::OutOfMemory`] if the start of RAM is unknown or the window has no room.
pub fn allocate_windowed<A: PageAllocator + ?Sized>(
    allocator: &A,
    architecture: Architecture,
    bytes: usize,
) -> Result<PageAllocation<'_, A>, BootError> {
    let ram_base = match allocator.ram_base() {
        Ok(base) => base,
        Err(e) => {
            warn!("Failed to determine the start of RAM: {e}");
            return Err(BootError::OutOfMemory);
        }
    };

    let bound = ram_base
        .checked_add(ramdisk_window(architecture) - 1)
        .unwrap_or(PhysicalAddress::new(u64::MAX));
    debug!("Ramdisk window: RAM base {ram_base}, highest address {bound}");

    let allocation = allocate(allocator, AllocateRegion::Below(bound), MemoryKind::Data, bytes)?;
    if allocation.last_byte() > bound {
        warn!(
            "Firmware placed {} pages at {}, beyond {bound}",
            allocation.pages(),
            allocation.base()
        );
        return Err(BootError::OutOfMemory);
    }
    Ok(allocation)
}
