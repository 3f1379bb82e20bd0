//! Boot-Parameter Marshaller.
//!
//! The EFI stub reads the kernel command line from the load options of the
//! loaded-image record it is started with, as NUL-terminated UTF-16LE. The
//! loader hands over its own image handle, so it rewrites its own load options
//! right before the jump and restores them if the jump does not happen.

use crate::BootError;
use crate::addresses::PhysicalAddress;
use crate::cmdline::BootCommandLine;
use crate::firmware::{Firmware, MemoryKind, RawLoadOptions};
use crate::placement::{PageAllocation, allocate_anywhere};
use alloc::string::String;
use log::{debug, warn};

/// The command line installed as load options.
#[must_use = "dropping the guard restores the previous load options"]
pub struct InstalledLoadOptions<'fw, F: Firmware + ?Sized> {
    firmware: &'fw F,
    previous: RawLoadOptions,
    installed: RawLoadOptions,
    // Freed after `previous` is restored.
    _buffer: PageAllocation<'fw, F>,
}

impl<F: Firmware + ?Sized> InstalledLoadOptions<'_, F> {
    #[must_use]
    pub const fn options(&self) -> RawLoadOptions {
        self.installed
    }
}

impl<F: Firmware + ?Sized> Drop for InstalledLoadOptions<'_, F> {
    fn drop(&mut self) {
        // SAFETY: `previous` was installed before us and is still owned by the firmware.
        if let Err(e) = unsafe { self.firmware.set_load_options(self.previous) } {
            warn!("Failed to restore load options: {e}");
        }
    }
}

/// Writes `cmdline` as UTF-16LE into fresh pages and installs it as the load options.
///
/// # Errors
/// * [`BootError::ParameterInstallFailure`] if the loaded-image record is unavailable.
/// * [`BootError::OutOfMemory`] if the buffer cannot be allocated.
pub fn install_load_options<'fw, F: Firmware + ?Sized>(
    firmware: &'fw F,
    cmdline: &BootCommandLine,
) -> Result<InstalledLoadOptions<'fw, F>, BootError> {
    let previous = firmware.load_options().map_err(|e| {
        warn!("Failed to locate the loaded image: {e}");
        BootError::ParameterInstallFailure
    })?;

    let units = cmdline.encode_utf16_with_nul().count();
    let bytes = units * 2;
    let size = u32::try_from(bytes).map_err(|_| BootError::ParameterInstallFailure)?;

    let buffer = allocate_anywhere(firmware, MemoryKind::Data, bytes)?;
    // SAFETY: Freshly allocated and at least `bytes` long.
    let target = unsafe { firmware.phys_to_slice_mut(buffer.base(), bytes) };
    for (slot, unit) in target.chunks_exact_mut(2).zip(cmdline.encode_utf16_with_nul()) {
        slot.copy_from_slice(&unit.to_le_bytes());
    }

    let installed = RawLoadOptions {
        address: buffer.base(),
        size,
    };
    // SAFETY: The buffer is owned by the returned guard, which uninstalls it before freeing.
    if let Err(e) = unsafe { firmware.set_load_options(installed) } {
        warn!("Failed to set load options: {e}");
        return Err(BootError::ParameterInstallFailure);
    }
    debug!("Load options @ {} ({size} bytes)", installed.address);

    Ok(InstalledLoadOptions {
        firmware,
        previous,
        installed,
        _buffer: buffer,
    })
}

/// Decodes UTF-16LE load options up to the first NUL.
///
/// Returns `None` for odd lengths or unpaired surrogates.
#[must_use]
pub fn decode_load_options(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0);
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .ok()
}

/// Reads the load options currently installed in `firmware`.
///
/// # Errors
/// [`BootError::ParameterInstallFailure`] if the loaded-image record is unavailable.
pub fn read_load_options<F: Firmware + ?Sized>(firmware: &F) -> Result<Option<String>, BootError> {
    let options = firmware
        .load_options()
        .map_err(|_| BootError::ParameterInstallFailure)?;
    if options.address == PhysicalAddress::zero() || options.size == 0 {
        return Ok(None);
    }
    // SAFETY: Installed load options stay mapped while installed.
    let bytes = unsafe { firmware.phys_to_slice_mut(options.address, options.size as usize) };
    Ok(decode_load_options(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::LoadOptions;
    use crate::test_support::{FakeFirmware, GIB};

    #[test]
    fn round_trip_through_the_loaded_image() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, GIB);
        let cmdline = BootCommandLine::assemble(&["/Image", "root=/dev/vda2", "quiet splash"]).unwrap();

        let installed = install_load_options(&fw, &cmdline).unwrap();
        let expected_units = cmdline.as_str().encode_utf16().count() + 1;
        assert_eq!(installed.options().size as usize, expected_units * 2);
        assert_eq!(
            read_load_options(&fw).unwrap().as_deref(),
            Some(cmdline.as_str())
        );
        drop(installed);

        assert_eq!(fw.load_options().unwrap(), RawLoadOptions::default());
        assert_eq!(fw.outstanding_allocations(), 0);
    }

    #[test]
    fn non_ascii_round_trip() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, GIB);
        let cmdline = BootCommandLine::assemble(&["/Image", "label=bücher", "emoji=🐧"]).unwrap();
        let _installed = install_load_options(&fw, &cmdline).unwrap();
        assert_eq!(
            read_load_options(&fw).unwrap().as_deref(),
            Some("BOOT_IMAGE=/Image label=bücher emoji=🐧")
        );
    }

    #[test]
    fn missing_loaded_image_is_a_parameter_failure() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, GIB);
        fw.hide_loaded_image(true);
        let cmdline = BootCommandLine::assemble(&["/Image"]).unwrap();
        assert_eq!(
            install_load_options(&fw, &cmdline).err(),
            Some(BootError::ParameterInstallFailure)
        );
        assert_eq!(fw.allocation_count(), 0);
    }

    #[test]
    fn allocation_failure_is_out_of_memory() {
        let fw = FakeFirmware::new().with_ram(0x4000_0000, GIB);
        fw.fail_allocations_after(0);
        let cmdline = BootCommandLine::assemble(&["/Image"]).unwrap();
        assert_eq!(
            install_load_options(&fw, &cmdline).err(),
            Some(BootError::OutOfMemory)
        );
        assert_eq!(fw.load_options().unwrap(), RawLoadOptions::default());
    }

    #[test]
    fn decoding_rejects_odd_lengths() {
        assert_eq!(decode_load_options(&[0x41]), None);
        assert_eq!(decode_load_options(&[0x41, 0, 0x42, 0]).as_deref(), Some("AB"));
        assert_eq!(decode_load_options(&[0x41, 0, 0, 0, 0x42, 0]).as_deref(), Some("A"));
    }
}
