//! File access used by the `linux` and `initrd` commands.

use alloc::string::String;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error("file `{0}' not found")]
    NotFound(String),
    #[error("`{0}' is not a regular file")]
    NotRegularFile(String),
    #[error("invalid file name `{0}'")]
    BadPath(String),
    #[error("failed to read `{0}'")]
    Io(String),
}

/// Opens files by path. Paths use `/` or `\` as separators.
pub trait FileSource {
    type File: BootFile;

    /// Opens `path` for reading.
    ///
    /// # Errors
    /// A [`FileError`] naming `path` if the file cannot be opened.
    fn open(&self, path: &str) -> Result<Self::File, FileError>;
}

/// An open file; closed when dropped.
pub trait BootFile {
    /// File size in bytes, as reported when the file was opened.
    fn size(&self) -> u64;

    /// Moves the read cursor to `position`.
    ///
    /// # Errors
    /// [`FileError::Io`] if the underlying file cannot seek.
    fn seek(&mut self, position: u64) -> Result<(), FileError>;

    /// Reads up to `buf.len()` bytes, returning how many were read. Zero means end of file.
    ///
    /// # Errors
    /// [`FileError::Io`] on a device error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileError>;
}

/// Reads until `buf` is full or the file ends, returning the number of bytes read.
///
/// # Errors
/// Propagates the first read error.
pub fn read_fully<F: BootFile + ?Sized>(file: &mut F, buf: &mut [u8]) -> Result<usize, FileError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeFiles;

    #[test]
    fn read_fully_collects_short_reads() {
        let files = FakeFiles::new().with_chunked("/a", vec![7u8; 1000], 64);
        let mut file = files.open("/a").unwrap();
        let mut buf = [0u8; 1000];
        assert_eq!(read_fully(&mut file, &mut buf).unwrap(), 1000);
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn read_fully_stops_at_end_of_file() {
        let files = FakeFiles::new().with_file("/a", vec![1u8; 10]);
        let mut file = files.open("/a").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read_fully(&mut file, &mut buf).unwrap(), 10);
    }

    #[test]
    fn missing_files_are_reported_by_name() {
        let files = FakeFiles::new();
        assert_eq!(
            files.open("/nope").err(),
            Some(FileError::NotFound("/nope".into()))
        );
    }
}
