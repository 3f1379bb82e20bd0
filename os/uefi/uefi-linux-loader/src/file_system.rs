use alloc::string::{String, ToString};
use linux_boot::file::{BootFile, FileError, FileSource};
use log::debug;
use uefi::proto::media::file::{File, FileAttribute, FileMode, RegularFile};
use uefi::{CString16, Status, boot};

/// Files on the volume the loader was started from.
#[derive(Debug, Default, Copy, Clone)]
pub struct EspFiles;

/// An open regular file on the loader's volume.
pub struct UefiFile {
    path: String,
    file: RegularFile,
    size: u64,
}

/// Converts `path` to a UEFI path, accepting `/` as a separator.
fn to_uefi_path(path: &str) -> Result<CString16, FileError> {
    let converted: String = path
        .chars()
        .map(|c| if c == '/' { '\\' } else { c })
        .collect();
    CString16::try_from(converted.as_str()).map_err(|_| FileError::BadPath(path.to_string()))
}

impl FileSource for EspFiles {
    type File = UefiFile;

    fn open(&self, path: &str) -> Result<UefiFile, FileError> {
        let uefi_path = to_uefi_path(path)?;
        let io = |_| FileError::Io(path.to_string());

        let mut sfs = boot::get_image_file_system(boot::image_handle()).map_err(io)?;
        let mut volume = sfs.open_volume().map_err(io)?;

        let handle = volume
            .open(&uefi_path, FileMode::Read, FileAttribute::empty())
            .map_err(|e| {
                if e.status() == Status::NOT_FOUND {
                    FileError::NotFound(path.to_string())
                } else {
                    FileError::Io(path.to_string())
                }
            })?;

        let Some(mut file) = handle.into_regular_file() else {
            return Err(FileError::NotRegularFile(path.to_string()));
        };

        file.set_position(RegularFile::END_OF_FILE).map_err(io)?;
        let size = file.get_position().map_err(io)?;
        file.set_position(0).map_err(io)?;
        debug!("Opened {path} ({size} bytes)");

        Ok(UefiFile {
            path: path.to_string(),
            file,
            size,
        })
    }
}

impl BootFile for UefiFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn seek(&mut self, position: u64) -> Result<(), FileError> {
        self.file
            .set_position(position)
            .map_err(|_| FileError::Io(self.path.clone()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileError> {
        self.file
            .read(buf)
            .map_err(|_| FileError::Io(self.path.clone()))
    }
}
