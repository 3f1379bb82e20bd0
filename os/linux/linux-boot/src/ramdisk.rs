//! Ramdisk aggregation.
//!
//! The `initrd` command accepts several files, which are concatenated into one
//! region. Every component starts at a 4-byte boundary; the padding in between
//! is zeroed so the kernel's cpio parser skips it.

use crate::BootError;
use crate::file::{BootFile, FileSource, read_fully};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::debug;

const COMPONENT_ALIGN: usize = 4;

const fn align_up(x: usize) -> usize {
    (x + COMPONENT_ALIGN - 1) & !(COMPONENT_ALIGN - 1)
}

struct Component<F> {
    path: String,
    file: F,
    offset: usize,
    size: usize,
}

/// The opened ramdisk files of one `initrd` command.
pub struct RamdiskSet<F: BootFile> {
    components: Vec<Component<F>>,
    size: usize,
}

impl<F: BootFile> RamdiskSet<F> {
    /// Opens all of `paths` and computes the aggregate layout.
    ///
    /// # Errors
    /// * [`BootError::File`] if any file cannot be opened.
    /// * [`BootError::OutOfMemory`] if the aggregate size does not fit in memory.
    pub fn open<S>(files: &S, paths: &[&str]) -> Result<Self, BootError>
    where
        S: FileSource<File = F> + ?Sized,
    {
        let mut components = Vec::new();
        components
            .try_reserve_exact(paths.len())
            .map_err(|_| BootError::OutOfMemory)?;

        let mut size = 0usize;
        for &path in paths {
            let file = files.open(path)?;
            let file_size = usize::try_from(file.size()).map_err(|_| BootError::OutOfMemory)?;
            let offset = align_up(size);
            size = offset
                .checked_add(file_size)
                .ok_or(BootError::OutOfMemory)?;
            debug!("{path}: {file_size} bytes at offset {offset:#x}");
            components.push(Component {
                path: path.to_string(),
                file,
                offset,
                size: file_size,
            });
        }

        Ok(Self { components, size })
    }

    /// Total size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Copies all components into `target`, which must be at least [`size`](Self::size) bytes.
    ///
    /// # Errors
    /// * [`BootError::TruncatedRead`] if a file ends before its reported size.
    /// * [`BootError::File`] on read errors.
    pub fn load_into(&mut self, target: &mut [u8]) -> Result<(), BootError> {
        let target = &mut target[..self.size];
        let mut cursor = 0;
        for component in &mut self.components {
            target[cursor..component.offset].fill(0);
            let end = component.offset + component.size;
            let read = read_fully(&mut component.file, &mut target[component.offset..end])?;
            if read < component.size {
                return Err(BootError::TruncatedRead {
                    path: component.path.clone(),
                });
            }
            cursor = end;
        }
        Ok(())
    }
}
