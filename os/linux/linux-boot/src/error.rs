use crate::file::FileError;
use alloc::string::String;
use linux_image::ImageError;

/// Reasons a loader command fails.
///
/// The messages are what the user sees on the console.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("{0}")]
    BadFormat(ImageError),
    #[error("plain image kernel not supported - rebuild with CONFIG_(U)EFI_STUB enabled")]
    UnsupportedBuild,
    #[error("{path} has invalid signature")]
    SignatureInvalid { path: String },
    #[error("out of memory")]
    OutOfMemory,
    #[error("failed to install/update FDT")]
    FirmwareConfigFailure,
    #[error("failed to create kernel parameters")]
    ParameterInstallFailure,
    #[error("you need to load the kernel first")]
    PrerequisiteNotLoaded,
    #[error("premature end of file {path}")]
    TruncatedRead { path: String },
    #[error("kernel entry returned to the loader")]
    HandoverDidNotExit,
    #[error("filename expected")]
    FilenameExpected,
    #[error(transparent)]
    File(#[from] FileError),
}

impl From<ImageError> for BootError {
    fn from(value: ImageError) -> Self {
        match value {
            ImageError::NotEfiStub => Self::UnsupportedBuild,
            other => Self::BadFormat(other),
        }
    }
}
