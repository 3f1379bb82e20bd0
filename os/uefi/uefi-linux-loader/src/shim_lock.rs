//! The shim lock protocol, installed by the shim first-stage loader when
//! Secure Boot is active.

use alloc::boxed::Box;
use core::ffi::c_void;
use linux_boot::secure_boot::{ImageVerifier, Verification};
use log::{debug, warn};
use uefi::boot::{self, ScopedProtocol};
use uefi::proto::unsafe_protocol;
use uefi::{Identify, Status};

/// Leading members of `SHIM_LOCK`. Only `verify` is used.
#[repr(C)]
#[unsafe_protocol("605dab50-e046-4300-abb6-3dd810dd8b23")]
pub struct ShimLock {
    verify: unsafe extern "efiapi" fn(buffer: *const c_void, size: u32) -> Status,
}

struct ShimVerifier(ScopedProtocol<ShimLock>);

impl ImageVerifier for ShimVerifier {
    fn verify(&self, image: &[u8]) -> bool {
        // The protocol takes a 32-bit size.
        let Ok(size) = u32::try_from(image.len()) else {
            warn!("Image of {} bytes is too large to verify", image.len());
            return false;
        };
        // SAFETY: The protocol stays open while `self` lives and reads `size` bytes of `image`.
        let status = unsafe { (self.0.verify)(image.as_ptr().cast(), size) };
        debug!("shim lock verify: {status:?}");
        status.is_success()
    }
}

/// Looks up the shim lock protocol.
pub fn locate() -> Verification<'static> {
    let Ok(handle) = boot::get_handle_for_protocol::<ShimLock>() else {
        return Verification::Unavailable;
    };
    match boot::open_protocol_exclusive::<ShimLock>(handle) {
        Ok(protocol) => Verification::Available(Box::new(ShimVerifier(protocol))),
        Err(e) => {
            warn!("Cannot open shim lock protocol {}: {e:?}", ShimLock::GUID);
            Verification::Unavailable
        }
    }
}
