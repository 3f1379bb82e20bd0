//! # PE/COFF header of EFI stub kernels
//!
//! Only the fields needed to locate the stub entry point are read.

use crate::{Architecture, ImageError};
use core::mem::size_of;
use core::ptr::read_unaligned;

const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";
const PE32_MAGIC: u16 = 0x010B;
const PE32_PLUS_MAGIC: u16 = 0x020B;

/// `IMAGE_FILE_MACHINE_ARM64`
pub const MACHINE_ARM64: u16 = 0xAA64;
/// `IMAGE_FILE_MACHINE_ARMNT` (Thumb-2)
pub const MACHINE_ARMNT: u16 = 0x01C4;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
struct CoffHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

/// Leading part of the optional header, identical for PE32 and PE32+.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct OptionalHeaderPrefix {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
}

const COFF_OFFSET: usize = PE_SIGNATURE.len();
const OPT_OFFSET: usize = COFF_OFFSET + size_of::<CoffHeader>();
const PE_HEADERS_SIZE: usize = OPT_OFFSET + size_of::<OptionalHeaderPrefix>();

/// What the loader needs from the PE/COFF headers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PeHeader {
    pub machine: u16,
    /// `AddressOfEntryPoint`: byte offset of the EFI stub from the image base.
    pub entry_point: u32,
}

impl PeHeader {
    /// Checks that the stub was built for `architecture`.
    ///
    /// # Errors
    /// [`ImageError::MachineMismatch`] for a stub of another machine type.
    pub const fn check_machine(self, architecture: Architecture) -> Result<(), ImageError> {
        let expected = architecture.pe_machine();
        if self.machine == expected {
            Ok(())
        } else {
            Err(ImageError::MachineMismatch {
                expected,
                found: self.machine,
            })
        }
    }
}

/// Reads the PE/COFF headers located at `pe_header_offset` in a fully loaded image.
///
/// # Errors
/// * [`ImageError::PeHeaderOutOfBounds`] if the headers do not fit in `image`.
/// * [`ImageError::BadPeSignature`] if `"PE\0\0"` is missing.
/// * [`ImageError::BadOptionalHeader`] for anything but a PE32/PE32+ optional header.
/// * [`ImageError::EntryOutOfBounds`] if the entry point is not inside `image`.
pub fn parse_pe_header(image: &[u8], pe_header_offset: u32) -> Result<PeHeader, ImageError> {
    let start = usize::try_from(pe_header_offset)
        .map_err(|_| ImageError::PeHeaderOutOfBounds(pe_header_offset))?;
    let end = start
        .checked_add(PE_HEADERS_SIZE)
        .ok_or(ImageError::PeHeaderOutOfBounds(pe_header_offset))?;
    if end > image.len() {
        return Err(ImageError::PeHeaderOutOfBounds(pe_header_offset));
    }

    let pe = &image[start..end];
    if pe[..COFF_OFFSET] != PE_SIGNATURE {
        return Err(ImageError::BadPeSignature);
    }

    // SAFETY: `pe` spans PE_HEADERS_SIZE bytes; reads are unaligned.
    let coff = unsafe { read_unaligned(pe.as_ptr().add(COFF_OFFSET).cast::<CoffHeader>()) };
    // SAFETY: As above.
    let opt =
        unsafe { read_unaligned(pe.as_ptr().add(OPT_OFFSET).cast::<OptionalHeaderPrefix>()) };

    let magic = u16::from_le(opt.magic);
    if magic != PE32_MAGIC && magic != PE32_PLUS_MAGIC {
        return Err(ImageError::BadOptionalHeader(magic));
    }
    if usize::from(u16::from_le(coff.size_of_optional_header)) < size_of::<OptionalHeaderPrefix>() {
        return Err(ImageError::BadOptionalHeader(magic));
    }

    let entry_point = u32::from_le(opt.address_of_entry_point);
    let in_bounds = usize::try_from(entry_point).is_ok_and(|entry| entry < image.len());
    if !in_bounds {
        return Err(ImageError::EntryOutOfBounds {
            entry: entry_point,
            size: image.len(),
        });
    }

    Ok(PeHeader {
        machine: u16::from_le(coff.machine),
        entry_point,
    })
}

/// Writes minimal PE/COFF headers into `image` at `offset`, for synthetic test kernels.
#[cfg(any(test, feature = "test-support"))]
pub fn write_test_pe_header(image: &mut [u8], offset: usize, machine: u16, entry_point: u32) {
    image[offset..offset + 4].copy_from_slice(&PE_SIGNATURE);
    image[offset + COFF_OFFSET..offset + COFF_OFFSET + 2].copy_from_slice(&machine.to_le_bytes());
    let opt_size = 0xF0_u16;
    image[offset + COFF_OFFSET + 16..offset + COFF_OFFSET + 18]
        .copy_from_slice(&opt_size.to_le_bytes());
    image[offset + OPT_OFFSET..offset + OPT_OFFSET + 2]
        .copy_from_slice(&PE32_PLUS_MAGIC.to_le_bytes());
    image[offset + OPT_OFFSET + 16..offset + OPT_OFFSET + 20]
        .copy_from_slice(&entry_point.to_le_bytes());
}
