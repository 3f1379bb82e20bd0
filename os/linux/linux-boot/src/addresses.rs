//! Physical addresses and page arithmetic.
//!
//! Firmware memory is identity mapped while boot services run, so a
//! [`PhysicalAddress`] can be turned into a pointer directly. The type still
//! keeps addresses and sizes apart.

use core::ffi::c_void;
use core::fmt;
use core::ops::Add;

/// Firmware page granularity.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`, rounded up.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Identity-mapped pointer to this address.
    ///
    /// Returns a null pointer if the address is not representable on this target.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr(self) -> *mut c_void {
        usize::try_from(self.0).map_or(core::ptr::null_mut(), |addr| addr as *mut c_void)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(bytes_to_pages(0), 0);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(4096), 1);
        assert_eq!(bytes_to_pages(4097), 2);
        assert_eq!(bytes_to_pages(10 * 1024 * 1024), 2560);
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0x8000_0000);
        assert_eq!(format!("{pa}"), "0x0000000080000000");
        assert_eq!(format!("{pa:?}"), "PA(0x0000000080000000)");
        assert_eq!(pa + 0x10, PhysicalAddress::new(0x8000_0010));
        assert_eq!(PhysicalAddress::new(u64::MAX).checked_add(1), None);
    }
}
