//! Module reference counting.
//!
//! The loader module must stay resident while a kernel is loaded, because the
//! loaded kernel's boot path runs loader code. A [`ModulePin`] holds one
//! reference for as long as it lives.

use core::sync::atomic::{AtomicUsize, Ordering};

pub struct ModuleRefCount {
    count: AtomicUsize,
}

impl ModuleRefCount {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn pin(&self) -> ModulePin<'_> {
        self.count.fetch_add(1, Ordering::AcqRel);
        ModulePin { module: self }
    }

    /// Whether any pin is alive.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.count() > 0
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for ModuleRefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// One reference on a [`ModuleRefCount`], released on drop.
#[must_use = "dropping the pin releases the reference"]
pub struct ModulePin<'m> {
    module: &'m ModuleRefCount,
}

impl Drop for ModulePin<'_> {
    fn drop(&mut self) {
        self.module.count.fetch_sub(1, Ordering::AcqRel);
    }
}
