//! # Boot Load Session
//!
//! The lifecycle controller behind the `linux`, `initrd`, `boot` and `unload`
//! commands.
//!
//! ```text
//!            linux ok                       boot
//!   Idle ───────────────► KernelLoaded ───────────► Booting ──► (kernel)
//!    ▲  ◄───────────────     │   ▲  │                  │
//!    │   unload / linux      │   │  │ initrd           │ kernel returned
//!    │   failed after        │   └──┘                  │
//!    │   header check        │ boot failed before      │
//!    │                       │ handover: stays loaded  │
//!    └───────────────────────┴─────────────────────────┘
//! ```
//!
//! The session owns every resource a command acquires. Commands acquire into
//! guards first and commit by moving the guards into the session, so a failing
//! command drops exactly what it acquired.

use crate::BootError;
use crate::addresses::PhysicalAddress;
use crate::augment::{RamdiskSpan, augment_device_tree};
use crate::cmdline::BootCommandLine;
use crate::file::{BootFile, FileSource, read_fully};
use crate::firmware::{Firmware, MemoryKind};
use crate::handover::{self, Handover, HandoverArguments, KernelEntry};
use crate::marshal::install_load_options;
use crate::module::{ModulePin, ModuleRefCount};
use crate::placement::{PageAllocation, allocate_anywhere, allocate_windowed};
use crate::ramdisk::RamdiskSet;
use crate::secure_boot::check_signature;
use alloc::string::ToString;
use core::convert::Infallible;
use linux_image::pe::parse_pe_header;
use linux_image::{Architecture, HEADER_SIZE, KernelHeader};
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    KernelLoaded,
    Booting,
}

struct LoadedRamdisk<'fw, F: Firmware + ?Sized> {
    region: PageAllocation<'fw, F>,
    size: usize,
}

impl<F: Firmware + ?Sized> LoadedRamdisk<'_, F> {
    fn span(&self) -> RamdiskSpan {
        let start = self.region.base();
        RamdiskSpan {
            start,
            end: start + self.size as u64,
        }
    }
}

struct LoadedKernel<'fw, F: Firmware + ?Sized> {
    image: PageAllocation<'fw, F>,
    size: usize,
    header: KernelHeader,
    entry: KernelEntry,
    cmdline: BootCommandLine,
    ramdisk: Option<LoadedRamdisk<'fw, F>>,
    _pin: ModulePin<'fw>,
}

/// Loader state between commands.
pub struct BootLoadSession<'fw, F: Firmware + ?Sized> {
    firmware: &'fw F,
    module: &'fw ModuleRefCount,
    architecture: Architecture,
    loaded: Option<LoadedKernel<'fw, F>>,
    booting: bool,
}

impl<'fw, F: Firmware + ?Sized> BootLoadSession<'fw, F> {
    /// A session for kernels of the loader's own architecture.
    #[must_use]
    pub const fn new(firmware: &'fw F, module: &'fw ModuleRefCount) -> Self {
        Self::for_architecture(firmware, module, Architecture::NATIVE)
    }

    #[must_use]
    pub const fn for_architecture(
        firmware: &'fw F,
        module: &'fw ModuleRefCount,
        architecture: Architecture,
    ) -> Self {
        Self {
            firmware,
            module,
            architecture,
            loaded: None,
            booting: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        match (&self.loaded, self.booting) {
            (None, _) => SessionState::Idle,
            (Some(_), false) => SessionState::KernelLoaded,
            (Some(_), true) => SessionState::Booting,
        }
    }

    #[must_use]
    pub const fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Command line of the loaded kernel.
    #[must_use]
    pub fn command_line(&self) -> Option<&str> {
        self.loaded.as_ref().map(|k| k.cmdline.as_str())
    }

    /// Address and size of the loaded kernel image.
    #[must_use]
    pub fn kernel_region(&self) -> Option<(PhysicalAddress, usize)> {
        self.loaded.as_ref().map(|k| (k.image.base(), k.size))
    }

    /// Validated header of the loaded kernel.
    #[must_use]
    pub fn kernel_header(&self) -> Option<&KernelHeader> {
        self.loaded.as_ref().map(|k| &k.header)
    }

    #[must_use]
    pub fn kernel_entry(&self) -> Option<KernelEntry> {
        self.loaded.as_ref().map(|k| k.entry)
    }

    /// Extent of the loaded ramdisk.
    #[must_use]
    pub fn ramdisk(&self) -> Option<RamdiskSpan> {
        self.loaded
            .as_ref()
            .and_then(|k| k.ramdisk.as_ref())
            .map(LoadedRamdisk::span)
    }

    /// `linux <path> [args…]`: loads a kernel, replacing any previous one.
    ///
    /// A kernel whose header fails validation leaves the previous kernel in place.
    /// Any later failure leaves the session idle.
    ///
    /// # Errors
    /// * [`BootError::FilenameExpected`] without arguments.
    /// * [`BootError::File`] if the kernel cannot be opened or read.
    /// * [`BootError::TruncatedRead`] if the file is shorter than it claims.
    /// * [`BootError::BadFormat`] / [`BootError::UnsupportedBuild`] for unusable images.
    /// * [`BootError::OutOfMemory`] if the image or command line cannot be allocated.
    /// * [`BootError::SignatureInvalid`] if the signature verifier rejects the image.
    pub fn load_kernel<S, A>(&mut self, files: &S, args: &[A]) -> Result<(), BootError>
    where
        S: FileSource + ?Sized,
        A: AsRef<str>,
    {
        let Some(path) = args.first().map(AsRef::as_ref) else {
            return Err(BootError::FilenameExpected);
        };
        let pin = self.module.pin();

        let mut file = files.open(path)?;
        let size = usize::try_from(file.size()).map_err(|_| BootError::OutOfMemory)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        if read_fully(&mut file, &mut header_bytes)? < HEADER_SIZE {
            return Err(BootError::TruncatedRead {
                path: path.to_string(),
            });
        }
        let header = KernelHeader::parse(self.architecture, &header_bytes)?;
        debug!("UEFI stub kernel:");
        debug!("PE/COFF header @ {:08x}", header.pe_header_offset);
        if let Some(details) = header.arm64 {
            debug!(
                "text_offset {:#x}, image_size {:#x}, flags {:?}",
                details.text_offset, details.image_size, details.flags
            );
        }

        self.unload();

        debug!("kernel file size: {size}");
        let image = allocate_anywhere(self.firmware, MemoryKind::Code, size)?;
        debug!("kernel numpages: {}", image.pages());

        file.seek(0)?;
        // SAFETY: The allocation is ours and at least `size` bytes long.
        let bytes = unsafe { self.firmware.phys_to_slice_mut(image.base(), size) };
        if read_fully(&mut file, bytes)? < size {
            return Err(BootError::TruncatedRead {
                path: path.to_string(),
            });
        }
        drop(file);
        debug!("kernel @ {}", image.base());

        check_signature(self.firmware, path, bytes)?;

        let pe = parse_pe_header(bytes, header.pe_header_offset)?;
        pe.check_machine(self.architecture)?;
        let entry = KernelEntry::new(image.base(), pe.entry_point);
        debug!("EFI stub entry @ {} (offset {:#x})", entry.address(), pe.entry_point);

        let cmdline = BootCommandLine::assemble(args)?;
        debug!("cmdline: '{cmdline}'");

        self.loaded = Some(LoadedKernel {
            image,
            size,
            header,
            entry,
            cmdline,
            ramdisk: None,
            _pin: pin,
        });
        info!("Loaded {} kernel {path} ({size} bytes)", self.architecture.name());
        Ok(())
    }

    /// `initrd <path> [path…]`: loads the concatenation of `paths` as the ramdisk,
    /// replacing any previous one.
    ///
    /// # Errors
    /// * [`BootError::FilenameExpected`] without paths.
    /// * [`BootError::PrerequisiteNotLoaded`] if no kernel is loaded.
    /// * [`BootError::File`] / [`BootError::TruncatedRead`] for unreadable files.
    /// * [`BootError::OutOfMemory`] if the ramdisk window has no room.
    pub fn load_ramdisk<S>(&mut self, files: &S, paths: &[&str]) -> Result<(), BootError>
    where
        S: FileSource + ?Sized,
    {
        if paths.is_empty() {
            return Err(BootError::FilenameExpected);
        }
        let Some(kernel) = self.loaded.as_mut() else {
            return Err(BootError::PrerequisiteNotLoaded);
        };

        let mut set = RamdiskSet::open(files, paths)?;
        let size = set.size();
        debug!("Loading initrd");

        let region = allocate_windowed(self.firmware, self.architecture, size)?;
        // SAFETY: The allocation is ours and at least `size` bytes long.
        let target = unsafe { self.firmware.phys_to_slice_mut(region.base(), size) };
        set.load_into(target)?;
        debug!("[addr={}, size={size:#x}]", region.base());

        kernel.ramdisk = Some(LoadedRamdisk { region, size });
        info!("Loaded ramdisk ({size} bytes)");
        Ok(())
    }

    /// `boot`: hands over to the loaded kernel.
    ///
    /// Returns only on failure. Failures before the handover undo the boot
    /// preparation and keep the kernel loaded; a kernel that returns leaves the
    /// session idle.
    ///
    /// # Errors
    /// * [`BootError::PrerequisiteNotLoaded`] if no kernel is loaded.
    /// * [`BootError::FirmwareConfigFailure`] if the device tree cannot be installed.
    /// * [`BootError::ParameterInstallFailure`] / [`BootError::OutOfMemory`] if the
    ///   command line cannot be installed.
    /// * [`BootError::HandoverDidNotExit`] if the kernel returned.
    pub fn boot<H: Handover + ?Sized>(&mut self, handover: &H) -> Result<Infallible, BootError> {
        let Some(kernel) = self.loaded.as_ref() else {
            return Err(BootError::PrerequisiteNotLoaded);
        };

        let ramdisk = kernel.ramdisk.as_ref().map(LoadedRamdisk::span);
        let device_tree = augment_device_tree(self.firmware, ramdisk)?;
        let load_options = install_load_options(self.firmware, &kernel.cmdline)?;
        debug!("linux command line: '{}'", kernel.cmdline);

        let args = HandoverArguments {
            image_handle: self.firmware.image_handle(),
            system_table: self.firmware.system_table(),
            kernel_base: kernel.image.base().as_mut_ptr(),
        };
        let entry = kernel.entry;

        self.booting = true;
        info!("Starting kernel at {}", entry.address());
        // SAFETY: The image was loaded and validated by `load_kernel` and stays allocated;
        // device tree and load options are installed until their guards drop.
        let error = unsafe { handover::execute(handover, entry, args) };
        self.booting = false;

        drop(load_options);
        drop(device_tree);
        self.unload();
        Err(error)
    }

    /// `unload`: releases the kernel, ramdisk and command line. Idempotent.
    pub fn unload(&mut self) {
        if self.loaded.take().is_some() {
            debug!("Unloaded kernel");
        }
        self.booting = false;
    }
}

impl<F: Firmware + ?Sized> Drop for BootLoadSession<'_, F> {
    fn drop(&mut self) {
        self.unload();
    }
}
