//! # ARM64 `Image` header flags

/// Page size the kernel was built for, as advertised in [`ImageFlags`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum KernelPageSize {
    Unspecified = 0,
    Size4K = 1,
    Size16K = 2,
    Size64K = 3,
}

impl KernelPageSize {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Unspecified,
            1 => Self::Size4K,
            2 => Self::Size16K,
            _ => Self::Size64K,
        }
    }
}

/// Bitfield wrapper for the 64-bit `flags` field of the ARM64 `Image` header.
///
/// Layout (LSB→MSB):
/// - bit 0: kernel endianness (1 = big endian)
/// - bits 1..2: kernel page size
/// - bit 3: physical placement (1 = anywhere in memory, 0 = close to the base of DRAM)
/// - bits 4..63: reserved
#[bitfield_struct::bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct ImageFlags {
    #[bits(1)]
    pub big_endian: bool,
    #[bits(2)]
    pub page_size: KernelPageSize,
    #[bits(1)]
    pub physical_placement: bool,
    #[bits(60)]
    __: u64,
}
