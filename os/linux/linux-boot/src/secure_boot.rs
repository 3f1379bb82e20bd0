//! Secure-Boot Gate.
//!
//! When a verification service (the shim lock protocol) is present, a kernel
//! is only accepted if the service vouches for its signature. Without the
//! service every kernel is accepted.

use crate::BootError;
use crate::firmware::VerifierLocator;
use alloc::boxed::Box;
use alloc::string::ToString;
use log::{debug, warn};

/// Signature verification service.
pub trait ImageVerifier {
    /// Returns `true` if `image` carries a valid signature.
    fn verify(&self, image: &[u8]) -> bool;
}

/// Outcome of looking up the verification service.
pub enum Verification<'a> {
    Available(Box<dyn ImageVerifier + 'a>),
    Unavailable,
}

impl Verification<'_> {
    #[must_use]
    pub fn accepts(&self, image: &[u8]) -> bool {
        match self {
            Self::Available(verifier) => verifier.verify(image),
            Self::Unavailable => true,
        }
    }
}

/// Checks the fully loaded kernel at `path`.
///
/// # Errors
/// [`BootError::SignatureInvalid`] if a verifier is present and rejects `image`.
pub fn check_signature<L: VerifierLocator + ?Sized>(
    locator: &L,
    path: &str,
    image: &[u8],
) -> Result<(), BootError> {
    let verification = locator.locate_verifier();
    if matches!(verification, Verification::Unavailable) {
        debug!("No signature verifier present, skipping verification of {path}");
    }

    if verification.accepts(image) {
        Ok(())
    } else {
        warn!("{path}: signature rejected");
        Err(BootError::SignatureInvalid {
            path: path.to_string(),
        })
    }
}
