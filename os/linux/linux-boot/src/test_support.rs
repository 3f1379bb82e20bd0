//! Host-side fakes for the firmware and file traits.
//!
//! Physical memory is simulated per allocation: every granted range is backed
//! by its own zeroed buffer, so large address spaces cost only what is actually
//! allocated. Placement is top-down within the configured RAM ranges, like the
//! firmware's `MaxAddress` allocations.

use crate::addresses::{PAGE_SIZE, PhysicalAddress};
use crate::file::{BootFile, FileError, FileSource};
use crate::firmware::{
    AllocateRegion, BootContext, ConfigurationTables, FirmwareError, LoadOptions, MemoryKind,
    PageAllocator, PhysMapper, RawLoadOptions, VerifierLocator,
};
use crate::handover::{Handover, HandoverArguments, KernelEntry};
use crate::marshal::read_load_options;
use crate::module::ModuleRefCount;
use crate::secure_boot::{ImageVerifier, Verification};
use core::cell::{Cell, RefCell};
use core::ffi::c_void;
use linux_image::Architecture;
use std::collections::BTreeMap;
use std::rc::Rc;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Where the firmware's own device tree lives, below every simulated RAM range.
const FIRMWARE_TREE_ADDRESS: u64 = 0x0010_0000;

/// A synthetic EFI stub kernel of `size` bytes.
pub fn test_kernel(architecture: Architecture, size: usize, entry_point: u32) -> Vec<u8> {
    let mut image = vec![0u8; size];
    linux_image::write_test_kernel(&mut image, architecture, entry_point);
    image
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VerifierMode {
    Unavailable,
    Accept,
    Reject,
}

struct Region {
    data: Box<[u8]>,
    /// `None` for memory owned by the firmware itself.
    pages: Option<usize>,
}

impl Region {
    fn end(&self, base: u64) -> u64 {
        base + self.data.len() as u64
    }
}

pub struct FakeFirmware {
    ram: Vec<(u64, u64)>,
    ram_base_known: bool,
    regions: RefCell<BTreeMap<u64, Region>>,
    allocations: Cell<usize>,
    frees: Cell<usize>,
    fail_after: Cell<Option<usize>>,
    device_tree: Cell<Option<PhysicalAddress>>,
    fail_device_tree_install: Cell<bool>,
    load_options: Cell<RawLoadOptions>,
    loaded_image_hidden: Cell<bool>,
    verifier: VerifierMode,
    verifications: Cell<usize>,
}

impl FakeFirmware {
    pub fn new() -> Self {
        Self {
            ram: Vec::new(),
            ram_base_known: true,
            regions: RefCell::new(BTreeMap::new()),
            allocations: Cell::new(0),
            frees: Cell::new(0),
            fail_after: Cell::new(None),
            device_tree: Cell::new(None),
            fail_device_tree_install: Cell::new(false),
            load_options: Cell::new(RawLoadOptions::default()),
            loaded_image_hidden: Cell::new(false),
            verifier: VerifierMode::Unavailable,
            verifications: Cell::new(0),
        }
    }

    /// Adds a write-back RAM range of `len` bytes at `start`.
    pub fn with_ram(mut self, start: u64, len: u64) -> Self {
        self.ram.push((start, len));
        self.ram.sort_unstable();
        self
    }

    /// Makes the memory map lookup for the start of RAM fail.
    pub fn without_ram_base(mut self) -> Self {
        self.ram_base_known = false;
        self
    }

    pub fn with_verifier(mut self, mode: VerifierMode) -> Self {
        self.verifier = mode;
        self
    }

    /// Installs `blob` as the firmware's own device tree.
    pub fn with_firmware_device_tree(self, blob: &[u8]) -> Self {
        self.regions.borrow_mut().insert(
            FIRMWARE_TREE_ADDRESS,
            Region {
                data: blob.to_vec().into_boxed_slice(),
                pages: None,
            },
        );
        self.device_tree
            .set(Some(PhysicalAddress::new(FIRMWARE_TREE_ADDRESS)));
        self
    }

    /// Fails every allocation once `n` allocations have succeeded.
    pub fn fail_allocations_after(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    /// Fails installing (but not removing or restoring) device trees.
    pub fn fail_device_tree_install(&self, fail: bool) {
        self.fail_device_tree_install.set(fail);
    }

    /// Makes the loaded-image record unavailable.
    pub fn hide_loaded_image(&self, hidden: bool) {
        self.loaded_image_hidden.set(hidden);
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }

    pub fn free_count(&self) -> usize {
        self.frees.get()
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.allocations.get() - self.frees.get()
    }

    pub fn verifications(&self) -> usize {
        self.verifications.get()
    }

    /// Copy of the installed device tree, `totalsize` bytes long.
    pub fn installed_device_tree(&self) -> Option<Vec<u8>> {
        let address = self.device_tree.get()?.as_u64();
        let regions = self.regions.borrow();
        let (&base, region) = regions.range(..=address).next_back()?;
        let bytes = &region.data[(address - base) as usize..];
        let size = linux_fdt::total_size(bytes).ok()?;
        Some(bytes[..size].to_vec())
    }

    /// Highest page-aligned free range of `bytes` whose last byte is at most `limit`.
    fn find_free(&self, bytes: u64, limit: u64) -> Option<u64> {
        let regions = self.regions.borrow();
        for &(start, len) in self.ram.iter().rev() {
            let mut end = (start + len).min(limit.saturating_add(1)) & !(PAGE_SIZE as u64 - 1);
            while end >= start + bytes {
                let candidate = end - bytes;
                let conflict = regions
                    .iter()
                    .filter(|&(&base, region)| base < end && candidate < region.end(base))
                    .map(|(&base, _)| base)
                    .max();
                match conflict {
                    Some(base) => end = base & !(PAGE_SIZE as u64 - 1),
                    None => return Some(candidate),
                }
            }
        }
        None
    }
}

impl PageAllocator for FakeFirmware {
    fn allocate_pages(
        &self,
        region: AllocateRegion,
        _kind: MemoryKind,
        pages: usize,
    ) -> Result<PhysicalAddress, FirmwareError> {
        if self
            .fail_after
            .get()
            .is_some_and(|n| self.allocations.get() >= n)
        {
            return Err(FirmwareError::OutOfResources);
        }

        let bytes = (pages * PAGE_SIZE) as u64;
        let limit = match region {
            AllocateRegion::Anywhere => u64::MAX,
            AllocateRegion::Below(max) => max.as_u64(),
        };
        let base = self
            .find_free(bytes, limit)
            .ok_or(FirmwareError::OutOfResources)?;

        self.regions.borrow_mut().insert(
            base,
            Region {
                data: vec![0u8; pages * PAGE_SIZE].into_boxed_slice(),
                pages: Some(pages),
            },
        );
        self.allocations.set(self.allocations.get() + 1);
        Ok(PhysicalAddress::new(base))
    }

    unsafe fn free_pages(&self, base: PhysicalAddress, pages: usize) -> Result<(), FirmwareError> {
        let region = self
            .regions
            .borrow_mut()
            .remove(&base.as_u64())
            .expect("freeing pages that were never allocated");
        assert_eq!(region.pages, Some(pages), "page count mismatch at {base}");
        self.frees.set(self.frees.get() + 1);
        Ok(())
    }

    fn ram_base(&self) -> Result<PhysicalAddress, FirmwareError> {
        if !self.ram_base_known {
            return Err(FirmwareError::NotFound);
        }
        self.ram
            .iter()
            .map(|&(start, _)| start)
            .min()
            .map(PhysicalAddress::new)
            .ok_or(FirmwareError::NotFound)
    }
}

impl PhysMapper for FakeFirmware {
    unsafe fn phys_to_slice_mut<'a>(&self, base: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let mut regions = self.regions.borrow_mut();
        let (&start, region) = regions
            .range_mut(..=base.as_u64())
            .next_back()
            .expect("access to unmapped physical memory");
        let offset = (base.as_u64() - start) as usize;
        assert!(
            offset + len <= region.data.len(),
            "access beyond the region at {start:#x}"
        );
        // SAFETY: The region's heap buffer does not move while it stays in the map.
        unsafe { core::slice::from_raw_parts_mut(region.data.as_mut_ptr().add(offset), len) }
    }
}

impl ConfigurationTables for FakeFirmware {
    fn device_tree(&self) -> Option<PhysicalAddress> {
        self.device_tree.get()
    }

    unsafe fn install_device_tree(
        &self,
        table: Option<PhysicalAddress>,
    ) -> Result<(), FirmwareError> {
        if table.is_some() && self.fail_device_tree_install.get() {
            return Err(FirmwareError::OutOfResources);
        }
        self.device_tree.set(table);
        Ok(())
    }
}

impl LoadOptions for FakeFirmware {
    fn load_options(&self) -> Result<RawLoadOptions, FirmwareError> {
        if self.loaded_image_hidden.get() {
            return Err(FirmwareError::NotFound);
        }
        Ok(self.load_options.get())
    }

    unsafe fn set_load_options(&self, options: RawLoadOptions) -> Result<(), FirmwareError> {
        if self.loaded_image_hidden.get() {
            return Err(FirmwareError::NotFound);
        }
        self.load_options.set(options);
        Ok(())
    }
}

struct FakeVerifier<'a> {
    accept: bool,
    calls: &'a Cell<usize>,
}

impl ImageVerifier for FakeVerifier<'_> {
    fn verify(&self, _image: &[u8]) -> bool {
        self.calls.set(self.calls.get() + 1);
        self.accept
    }
}

impl VerifierLocator for FakeFirmware {
    fn locate_verifier(&self) -> Verification<'_> {
        let accept = match self.verifier {
            VerifierMode::Unavailable => return Verification::Unavailable,
            VerifierMode::Accept => true,
            VerifierMode::Reject => false,
        };
        Verification::Available(Box::new(FakeVerifier {
            accept,
            calls: &self.verifications,
        }))
    }
}

impl BootContext for FakeFirmware {
    fn image_handle(&self) -> *mut c_void {
        core::ptr::without_provenance_mut(0xA1A1_0000)
    }

    fn system_table(&self) -> *mut c_void {
        core::ptr::without_provenance_mut(0x5757_0000)
    }
}

#[derive(Clone)]
struct FakeEntry {
    data: Rc<Vec<u8>>,
    /// Bytes that can actually be read; the rest of `data` is lost.
    readable: usize,
    /// Largest amount returned by a single read.
    chunk: usize,
}

/// In-memory files.
#[derive(Default)]
pub struct FakeFiles {
    files: BTreeMap<String, FakeEntry>,
}

impl FakeFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, data: Vec<u8>) -> Self {
        let readable = data.len();
        self.with_entry(path, data, readable, usize::MAX)
    }

    /// A file that reports `data.len()` bytes but ends after `readable`.
    pub fn with_truncated(self, path: &str, data: Vec<u8>, readable: usize) -> Self {
        self.with_entry(path, data, readable, usize::MAX)
    }

    /// A file returning at most `chunk` bytes per read.
    pub fn with_chunked(self, path: &str, data: Vec<u8>, chunk: usize) -> Self {
        let readable = data.len();
        self.with_entry(path, data, readable, chunk)
    }

    fn with_entry(mut self, path: &str, data: Vec<u8>, readable: usize, chunk: usize) -> Self {
        self.files.insert(
            path.to_string(),
            FakeEntry {
                data: Rc::new(data),
                readable,
                chunk,
            },
        );
        self
    }
}

impl FileSource for FakeFiles {
    type File = FakeFile;

    fn open(&self, path: &str) -> Result<FakeFile, FileError> {
        let entry = self
            .files
            .get(path)
            .ok_or_else(|| FileError::NotFound(path.to_string()))?;
        Ok(FakeFile {
            entry: entry.clone(),
            position: 0,
        })
    }
}

pub struct FakeFile {
    entry: FakeEntry,
    position: usize,
}

impl BootFile for FakeFile {
    fn size(&self) -> u64 {
        self.entry.data.len() as u64
    }

    fn seek(&mut self, position: u64) -> Result<(), FileError> {
        self.position = usize::try_from(position).map_err(|_| FileError::Io("seek".into()))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileError> {
        let available = self.entry.readable.saturating_sub(self.position);
        let n = available.min(buf.len()).min(self.entry.chunk);
        buf[..n].copy_from_slice(&self.entry.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// What a [`RecordingHandover`] observed at the moment of the jump.
#[derive(Debug, Clone)]
pub struct Seen {
    pub entry: KernelEntry,
    pub args: HandoverArguments,
    pub cmdline: Option<String>,
    pub device_tree: Option<Vec<u8>>,
    /// Module references held during the jump, if a module is watched.
    pub pins: Option<usize>,
}

/// A handover that records the boot environment and returns, like a kernel
/// that refuses to start.
pub struct RecordingHandover<'a> {
    firmware: &'a FakeFirmware,
    module: Option<&'a ModuleRefCount>,
    seen: RefCell<Option<Seen>>,
}

impl<'a> RecordingHandover<'a> {
    pub fn new(firmware: &'a FakeFirmware) -> Self {
        Self {
            firmware,
            module: None,
            seen: RefCell::new(None),
        }
    }

    /// Also records the reference count of `module` at the jump.
    pub fn watching(mut self, module: &'a ModuleRefCount) -> Self {
        self.module = Some(module);
        self
    }

    pub fn seen(&self) -> Option<Seen> {
        self.seen.borrow().clone()
    }
}

impl Handover for RecordingHandover<'_> {
    unsafe fn enter(&self, entry: KernelEntry, args: HandoverArguments) {
        let cmdline = read_load_options(self.firmware).ok().flatten();
        let device_tree = self.firmware.installed_device_tree();
        *self.seen.borrow_mut() = Some(Seen {
            entry,
            args,
            cmdline,
            device_tree,
            pins: self.module.map(ModuleRefCount::count),
        });
    }
}
