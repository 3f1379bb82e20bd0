//! # Linux ARM/ARM64 Kernel Image Headers
//!
//! Inspection of the self-describing header at the start of a Linux kernel
//! image (`Image` on ARM64, `zImage` on 32-bit ARM) built with the EFI stub.
//!
//! ## Header Layout
//!
//! Both architectures reserve the first 64 bytes of the file for a header that
//! doubles as an MS-DOS stub, so the same file is at the same time a kernel
//! image and a PE/COFF executable:
//!
//! ```text
//! ARM64 (Documentation/arm64/booting.rst)      ARM (zImage)
//! 0x00  code0        "MZ" + branch              0x00  code0       "MZ" + branch
//! 0x04  code1                                   0x04  reserved[8]
//! 0x08  text_offset                             0x24  magic       0x016f2818
//! 0x10  image_size                              0x28  start
//! 0x18  flags                                   0x2c  end
//! 0x20  res2..res4                              0x30  reserved[3]
//! 0x38  magic        "ARM\x64"                  0x3c  hdr_offset  -> "PE\0\0"
//! 0x3c  hdr_offset   -> "PE\0\0"
//! ```
//!
//! ## Validation
//!
//! [`KernelHeader::parse`] accepts a header only if
//! 1. the architecture magic matches ([`ImageError::BadMagic`] otherwise), and
//! 2. `code0` carries the `MZ` signature of the PE/COFF wrapper. A kernel with a
//!    correct magic but without the wrapper was built without the EFI stub and
//!    is rejected with [`ImageError::NotEfiStub`].
//!
//! The PE/COFF header offset exposed on success is consumed by
//! [`pe::parse_pe_header`] once the full image is in memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod flags;
pub mod pe;

pub use flags::{ImageFlags, KernelPageSize};

use core::mem::size_of;
use core::ptr::read_unaligned;

/// Number of bytes that must be read from the start of the file before
/// calling [`KernelHeader::parse`].
pub const HEADER_SIZE: usize = 64;

/// `"MZ"`, the MS-DOS/PE signature in the low half of `code0`.
pub const EFI_PE_MAGIC: u16 = 0x5A4D;

/// `"ARM\x64"`, little endian.
pub const ARM64_MAGIC: u32 = 0x644D_5241;

/// zImage magic of 32-bit ARM kernels.
pub const ARM_MAGIC: u32 = 0x016F_2818;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Arm64KernelHeader {
    code0: u32,
    code1: u32,
    text_offset: u64,
    image_size: u64,
    flags: u64,
    res2: u64,
    res3: u64,
    res4: u64,
    magic: u32,
    hdr_offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ArmKernelHeader {
    code0: u32,
    reserved1: [u32; 8],
    magic: u32,
    start: u32,
    end: u32,
    reserved2: [u32; 3],
    hdr_offset: u32,
}

const _: () = assert!(size_of::<Arm64KernelHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<ArmKernelHeader>() == HEADER_SIZE);

/// The kernel flavour a header is checked against.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Architecture {
    /// 32-bit ARM `zImage`.
    Arm,
    /// AArch64 `Image`.
    Arm64,
}

impl Architecture {
    /// The architecture this loader itself was built for.
    #[cfg(target_pointer_width = "32")]
    pub const NATIVE: Self = Self::Arm;

    /// The architecture this loader itself was built for.
    #[cfg(not(target_pointer_width = "32"))]
    pub const NATIVE: Self = Self::Arm64;

    #[must_use]
    pub const fn magic(self) -> u32 {
        match self {
            Self::Arm => ARM_MAGIC,
            Self::Arm64 => ARM64_MAGIC,
        }
    }

    /// PE/COFF machine type of the EFI stub.
    #[must_use]
    pub const fn pe_machine(self) -> u16 {
        match self {
            Self::Arm => pe::MACHINE_ARMNT,
            Self::Arm64 => pe::MACHINE_ARM64,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }
}

/// Errors raised while inspecting a kernel image.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("kernel header truncated: got {0} bytes, need 64")]
    Truncated(usize),
    #[error("invalid magic number")]
    BadMagic,
    #[error("plain image kernel not supported - rebuild with CONFIG_(U)EFI_STUB enabled")]
    NotEfiStub,
    #[error("PE/COFF header at offset {0:#x} lies outside the image")]
    PeHeaderOutOfBounds(u32),
    #[error("missing PE signature")]
    BadPeSignature,
    #[error("unsupported PE optional header (magic {0:#06x})")]
    BadOptionalHeader(u16),
    #[error("entry point {entry:#x} lies outside the image ({size} bytes)")]
    EntryOutOfBounds { entry: u32, size: usize },
    #[error("PE/COFF machine {found:#06x} does not match {expected:#06x}")]
    MachineMismatch { expected: u16, found: u16 },
}

/// ARM64-only header fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Arm64Details {
    /// Image load offset from a 2 MiB aligned base.
    pub text_offset: u64,
    /// Effective image size, including BSS. Zero on kernels older than 3.17.
    pub image_size: u64,
    pub flags: ImageFlags,
}

/// A header that passed both signature checks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelHeader {
    pub architecture: Architecture,
    /// File offset of the `"PE\0\0"` signature.
    pub pe_header_offset: u32,
    /// Present for [`Architecture::Arm64`] only.
    pub arm64: Option<Arm64Details>,
}

impl KernelHeader {
    /// Validates the first [`HEADER_SIZE`] bytes of a kernel file.
    ///
    /// # Errors
    /// * [`ImageError::Truncated`] if fewer than [`HEADER_SIZE`] bytes were given.
    /// * [`ImageError::BadMagic`] if the architecture magic does not match.
    /// * [`ImageError::NotEfiStub`] if the magic matches but the image lacks the
    ///   PE/COFF wrapper.
    pub fn parse(architecture: Architecture, bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::Truncated(bytes.len()));
        }

        let (code0, magic, pe_header_offset, arm64) = match architecture {
            Architecture::Arm64 => {
                // SAFETY: Length checked above; the read tolerates any alignment.
                let lh = unsafe { read_unaligned(bytes.as_ptr().cast::<Arm64KernelHeader>()) };
                let details = Arm64Details {
                    text_offset: u64::from_le(lh.text_offset),
                    image_size: u64::from_le(lh.image_size),
                    flags: ImageFlags::from_bits(u64::from_le(lh.flags)),
                };
                (
                    u32::from_le(lh.code0),
                    u32::from_le(lh.magic),
                    u32::from_le(lh.hdr_offset),
                    Some(details),
                )
            }
            Architecture::Arm => {
                // SAFETY: Length checked above; the read tolerates any alignment.
                let lh = unsafe { read_unaligned(bytes.as_ptr().cast::<ArmKernelHeader>()) };
                (
                    u32::from_le(lh.code0),
                    u32::from_le(lh.magic),
                    u32::from_le(lh.hdr_offset),
                    None,
                )
            }
        };

        if magic != architecture.magic() {
            return Err(ImageError::BadMagic);
        }

        if code0 & 0xFFFF != u32::from(EFI_PE_MAGIC) {
            return Err(ImageError::NotEfiStub);
        }

        Ok(Self {
            architecture,
            pe_header_offset,
            arm64,
        })
    }
}

/// Writes a well-formed EFI stub kernel header for `architecture` into the
/// first [`HEADER_SIZE`] bytes of `image`.
#[cfg(any(test, feature = "test-support"))]
pub fn write_test_header(image: &mut [u8], architecture: Architecture, pe_header_offset: u32) {
    let h = &mut image[..HEADER_SIZE];
    h.fill(0);
    h[0..4].copy_from_slice(&(0x9100_0000_u32 | u32::from(EFI_PE_MAGIC)).to_le_bytes());
    match architecture {
        Architecture::Arm64 => {
            h[0x08..0x10].copy_from_slice(&0x8_0000_u64.to_le_bytes());
            h[0x10..0x18].copy_from_slice(&0x0180_0000_u64.to_le_bytes());
            h[0x18..0x20].copy_from_slice(&0b1010_u64.to_le_bytes());
            h[0x38..0x3C].copy_from_slice(&ARM64_MAGIC.to_le_bytes());
        }
        Architecture::Arm => {
            h[0x24..0x28].copy_from_slice(&ARM_MAGIC.to_le_bytes());
        }
    }
    h[0x3C..0x40].copy_from_slice(&pe_header_offset.to_le_bytes());
}

/// Writes a complete synthetic EFI stub kernel: header at offset 0 and PE/COFF
/// headers at offset `0x40` with the given entry point.
#[cfg(any(test, feature = "test-support"))]
pub fn write_test_kernel(image: &mut [u8], architecture: Architecture, entry_point: u32) {
    write_test_header(image, architecture, 0x40);
    pe::write_test_pe_header(image, 0x40, architecture.pe_machine(), entry_point);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_header(arch: Architecture, pe_offset: u32) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        write_test_header(&mut h, arch, pe_offset);
        h
    }

    const fn magic_offset(arch: Architecture) -> usize {
        match arch {
            Architecture::Arm => 0x24,
            Architecture::Arm64 => 0x38,
        }
    }

    #[test]
    fn accepts_stub_kernels() {
        for arch in [Architecture::Arm, Architecture::Arm64] {
            let h = KernelHeader::parse(arch, &stub_header(arch, 0x40)).unwrap();
            assert_eq!(h.architecture, arch);
            assert_eq!(h.pe_header_offset, 0x40);
            assert_eq!(h.arm64.is_some(), arch == Architecture::Arm64);
        }
    }

    #[test]
    fn arm64_details_are_decoded() {
        let h = KernelHeader::parse(Architecture::Arm64, &stub_header(Architecture::Arm64, 0x40))
            .unwrap();
        let d = h.arm64.unwrap();
        assert_eq!(d.text_offset, 0x8_0000);
        assert_eq!(d.image_size, 0x0180_0000);
        assert!(!d.flags.big_endian());
        assert_eq!(d.flags.page_size(), KernelPageSize::Size4K);
        assert!(d.flags.physical_placement());
    }

    #[test]
    fn short_header_is_rejected() {
        let h = stub_header(Architecture::Arm64, 0x40);
        assert_eq!(
            KernelHeader::parse(Architecture::Arm64, &h[..HEADER_SIZE - 1]),
            Err(ImageError::Truncated(HEADER_SIZE - 1))
        );
    }

    #[test]
    fn any_bit_flip_in_the_magic_is_bad_format() {
        for arch in [Architecture::Arm, Architecture::Arm64] {
            let at = magic_offset(arch);
            for bit in 0..32 {
                let mut h = stub_header(arch, 0x40);
                h[at + bit / 8] ^= 1 << (bit % 8);
                assert_eq!(
                    KernelHeader::parse(arch, &h),
                    Err(ImageError::BadMagic),
                    "{arch:?} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn any_bit_flip_in_the_pe_signature_is_unsupported_build() {
        for arch in [Architecture::Arm, Architecture::Arm64] {
            for bit in 0..16 {
                let mut h = stub_header(arch, 0x40);
                h[bit / 8] ^= 1 << (bit % 8);
                assert_eq!(
                    KernelHeader::parse(arch, &h),
                    Err(ImageError::NotEfiStub),
                    "{arch:?} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn upper_half_of_code0_is_ignored() {
        let mut h = stub_header(Architecture::Arm64, 0x40);
        h[2] ^= 0xFF;
        h[3] ^= 0xFF;
        assert!(KernelHeader::parse(Architecture::Arm64, &h).is_ok());
    }

    #[test]
    fn magic_is_checked_before_the_wrapper() {
        let mut h = stub_header(Architecture::Arm64, 0x40);
        h[0] = 0;
        h[0x38] = 0;
        assert_eq!(
            KernelHeader::parse(Architecture::Arm64, &h),
            Err(ImageError::BadMagic)
        );
    }

    #[test]
    fn other_architecture_is_bad_format() {
        let h = stub_header(Architecture::Arm, 0x40);
        assert_eq!(
            KernelHeader::parse(Architecture::Arm64, &h),
            Err(ImageError::BadMagic)
        );
    }
}
