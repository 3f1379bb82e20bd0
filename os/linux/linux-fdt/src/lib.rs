//! # Flattened Device Tree Editing
//!
//! In-place editing of a flattened device tree (FDT, "DTB") blob that lives in a
//! caller-provided buffer with some free space at its end.
//!
//! ## Blob Layout
//!
//! ```text
//! ┌────────────────────┐ 0
//! │ header (40 bytes)  │ magic, totalsize, block offsets and sizes (big endian)
//! ├────────────────────┤ off_mem_rsvmap
//! │ memory reservation │ (address, size) pairs terminated by (0, 0)
//! ├────────────────────┤ off_dt_struct
//! │ structure block    │ BEGIN_NODE name … PROP len nameoff value … END_NODE … END
//! ├────────────────────┤ off_dt_strings
//! │ strings block      │ NUL-terminated property names
//! ├────────────────────┤
//! │ free space         │ up to totalsize
//! └────────────────────┘ totalsize
//! ```
//!
//! Every edit inserts, removes or resizes bytes inside the structure block and
//! shifts the strings block that follows it, or appends to the strings block.
//! Both consume the free space between the end of the strings block and
//! `totalsize`; an edit that does not fit fails with [`FdtError::NoSpace`] and
//! leaves the structure block untouched.
//!
//! Only trees whose structure block precedes the strings block are editable,
//! which is what `dtc` and every firmware in practice emit.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub const FDT_MAGIC: u32 = 0xD00D_FEED;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

const HEADER_SIZE: usize = 40;
const RSVMAP_ENTRY_SIZE: usize = 16;
const LAST_VERSION: u32 = 17;
const LAST_COMP_VERSION: u32 = 16;

/// Size of a tree holding nothing but an empty root node.
pub const EMPTY_TREE_SIZE: usize = HEADER_SIZE + RSVMAP_ENTRY_SIZE + 16;

mod field {
    pub const MAGIC: usize = 0;
    pub const TOTALSIZE: usize = 4;
    pub const OFF_DT_STRUCT: usize = 8;
    pub const OFF_DT_STRINGS: usize = 12;
    pub const OFF_MEM_RSVMAP: usize = 16;
    pub const VERSION: usize = 20;
    pub const LAST_COMP_VERSION: usize = 24;
    pub const SIZE_DT_STRINGS: usize = 32;
    pub const SIZE_DT_STRUCT: usize = 36;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FdtError {
    #[error("not a flattened device tree")]
    BadMagic,
    #[error("unsupported device tree version {0}")]
    BadVersion(u32),
    #[error("device tree blob is truncated")]
    Truncated,
    #[error("device tree blocks are laid out in an unsupported order")]
    BadLayout,
    #[error("malformed device tree structure block")]
    BadStructure,
    #[error("offset does not refer to a node")]
    BadOffset,
    #[error("invalid node or property name")]
    BadName,
    #[error("not enough free space in the device tree buffer")]
    NoSpace,
}

/// Offset of a `BEGIN_NODE` token within the structure block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Node(usize);

impl Node {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

#[inline]
const fn align4(x: usize) -> usize {
    (x + 3) & !3
}

#[inline]
fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn put_be32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Returns the `totalsize` recorded in the header of `blob`.
///
/// # Errors
/// [`FdtError::Truncated`] if `blob` cannot hold a header, [`FdtError::BadMagic`]
/// if it is not a device tree.
pub fn total_size(blob: &[u8]) -> Result<usize, FdtError> {
    if blob.len() < HEADER_SIZE {
        return Err(FdtError::Truncated);
    }
    if be32(blob, field::MAGIC) != FDT_MAGIC {
        return Err(FdtError::BadMagic);
    }
    Ok(be32(blob, field::TOTALSIZE) as usize)
}

/// Writes a tree with an empty root node into `blob`, using all of `blob` as
/// `totalsize`.
///
/// # Errors
/// [`FdtError::NoSpace`] if `blob` is smaller than [`EMPTY_TREE_SIZE`].
pub fn create_empty_tree(blob: &mut [u8]) -> Result<DeviceTree<'_>, FdtError> {
    if blob.len() < EMPTY_TREE_SIZE {
        return Err(FdtError::NoSpace);
    }
    let total = u32::try_from(blob.len()).map_err(|_| FdtError::BadLayout)?;

    let structure = HEADER_SIZE + RSVMAP_ENTRY_SIZE;

    blob[..EMPTY_TREE_SIZE].fill(0);
    put_be32(blob, field::MAGIC, FDT_MAGIC);
    put_be32(blob, field::TOTALSIZE, total);
    put_be32(blob, field::OFF_DT_STRUCT, 56);
    put_be32(blob, field::OFF_DT_STRINGS, 72);
    put_be32(blob, field::OFF_MEM_RSVMAP, 40);
    put_be32(blob, field::VERSION, LAST_VERSION);
    put_be32(blob, field::LAST_COMP_VERSION, LAST_COMP_VERSION);
    put_be32(blob, field::SIZE_DT_STRINGS, 0);
    put_be32(blob, field::SIZE_DT_STRUCT, 16);

    // Root node with an empty name (4 zero bytes), then END_NODE and END.
    put_be32(blob, structure, FDT_BEGIN_NODE);
    put_be32(blob, structure + 8, FDT_END_NODE);
    put_be32(blob, structure + 12, FDT_END);

    DeviceTree::from_blob(blob)
}

/// A validated device tree borrowed mutably from its backing buffer.
pub struct DeviceTree<'a> {
    blob: &'a mut [u8],
}

impl<'a> DeviceTree<'a> {
    /// Validates the header of the tree at the start of `blob`.
    ///
    /// # Errors
    /// * [`FdtError::Truncated`] if the header or a block does not fit.
    /// * [`FdtError::BadMagic`] / [`FdtError::BadVersion`] for foreign or pre-v17 blobs.
    /// * [`FdtError::BadLayout`] if the structure block does not precede the strings block.
    /// * [`FdtError::BadStructure`] if the structure block does not start with a node.
    pub fn from_blob(blob: &'a mut [u8]) -> Result<Self, FdtError> {
        let total = total_size(blob)?;
        let version = be32(blob, field::VERSION);
        if version < LAST_VERSION {
            return Err(FdtError::BadVersion(version));
        }
        if total > blob.len() || total < HEADER_SIZE {
            return Err(FdtError::Truncated);
        }

        let off_struct = be32(blob, field::OFF_DT_STRUCT) as usize;
        let size_struct = be32(blob, field::SIZE_DT_STRUCT) as usize;
        let off_strings = be32(blob, field::OFF_DT_STRINGS) as usize;
        let size_strings = be32(blob, field::SIZE_DT_STRINGS) as usize;

        let struct_end = off_struct
            .checked_add(size_struct)
            .ok_or(FdtError::Truncated)?;
        let strings_end = off_strings
            .checked_add(size_strings)
            .ok_or(FdtError::Truncated)?;
        if struct_end > total || strings_end > total {
            return Err(FdtError::Truncated);
        }
        if off_struct < HEADER_SIZE || struct_end > off_strings {
            return Err(FdtError::BadLayout);
        }

        let tree = Self { blob };
        if tree.struct_u32(0)? != FDT_BEGIN_NODE {
            return Err(FdtError::BadStructure);
        }
        Ok(tree)
    }

    /// The `totalsize` header field.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.header(field::TOTALSIZE)
    }

    /// Grows or shrinks the space the tree may use within its buffer.
    ///
    /// # Errors
    /// [`FdtError::NoSpace`] if `size` exceeds the buffer, [`FdtError::BadLayout`] if it
    /// would cut into the strings block.
    pub fn set_total_size(&mut self, size: usize) -> Result<(), FdtError> {
        if size > self.blob.len() {
            return Err(FdtError::NoSpace);
        }
        if size < self.strings_end() {
            return Err(FdtError::BadLayout);
        }
        self.set_header(field::TOTALSIZE, size)
    }

    /// The tree bytes up to `totalsize`.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob[..self.total_size()]
    }

    /// Looks up a direct child of `parent` by its full name.
    ///
    /// # Errors
    /// [`FdtError::BadOffset`] if `parent` is not a node, [`FdtError::BadStructure`] if the
    /// structure block is malformed.
    pub fn find_subnode(&self, parent: Node, name: &str) -> Result<Option<Node>, FdtError> {
        let mut offset = self.node_body(parent)?;
        let mut depth = 0usize;
        loop {
            let (tag, next) = self.token(offset)?;
            match tag {
                FDT_BEGIN_NODE => {
                    if depth == 0 && self.name_at(offset + 4)? == name.as_bytes() {
                        return Ok(Some(Node(offset)));
                    }
                    depth += 1;
                }
                FDT_END_NODE => {
                    if depth == 0 {
                        return Ok(None);
                    }
                    depth -= 1;
                }
                FDT_END => return Err(FdtError::BadStructure),
                _ => {}
            }
            offset = next;
        }
    }

    /// Adds an empty child node named `name` to `parent`, after its properties.
    ///
    /// # Errors
    /// [`FdtError::BadName`] for empty names or names with NUL bytes,
    /// [`FdtError::NoSpace`] if the buffer is full, or a structure error.
    pub fn add_subnode(&mut self, parent: Node, name: &str) -> Result<Node, FdtError> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(FdtError::BadName);
        }

        let at = self.first_non_property(parent)?;
        let name_len = align4(name.len() + 1);
        self.make_room(at, 0, 4 + name_len + 4)?;

        let base = self.header(field::OFF_DT_STRUCT) + at;
        put_be32(self.blob, base, FDT_BEGIN_NODE);
        let name_field = &mut self.blob[base + 4..base + 4 + name_len];
        name_field.fill(0);
        name_field[..name.len()].copy_from_slice(name.as_bytes());
        put_be32(self.blob, base + 4 + name_len, FDT_END_NODE);

        Ok(Node(at))
    }

    /// Returns the value of property `name` of `node`, if present.
    ///
    /// # Errors
    /// [`FdtError::BadOffset`] if `node` is not a node, or a structure error.
    pub fn property(&self, node: Node, name: &str) -> Result<Option<&[u8]>, FdtError> {
        let Some(prop) = self.find_property(node, name)? else {
            return Ok(None);
        };
        let len = self.struct_u32(prop + 4)? as usize;
        let start = self.header(field::OFF_DT_STRUCT) + prop + 12;
        Ok(Some(&self.blob[start..start + len]))
    }

    /// Creates or replaces property `name` of `node`.
    ///
    /// # Errors
    /// [`FdtError::NoSpace`] if the buffer is full, [`FdtError::BadName`] for invalid
    /// names, [`FdtError::BadOffset`] if `node` is not a node, or a structure error.
    pub fn set_property(&mut self, node: Node, name: &str, value: &[u8]) -> Result<(), FdtError> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(FdtError::BadName);
        }
        let len = u32::try_from(value.len()).map_err(|_| FdtError::NoSpace)?;
        let padded = align4(value.len());

        let prop = if let Some(prop) = self.find_property(node, name)? {
            let old_len = self.struct_u32(prop + 4)? as usize;
            self.make_room(prop + 12, align4(old_len), padded)?;
            prop
        } else {
            let name_offset = self.find_or_add_string(name)?;
            let at = self.node_body(node)?;
            self.make_room(at, 0, 12 + padded)?;
            let base = self.header(field::OFF_DT_STRUCT) + at;
            put_be32(self.blob, base, FDT_PROP);
            put_be32(self.blob, base + 8, name_offset);
            at
        };

        let base = self.header(field::OFF_DT_STRUCT) + prop;
        put_be32(self.blob, base + 4, len);
        let field = &mut self.blob[base + 12..base + 12 + padded];
        field.fill(0);
        field[..value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Creates or replaces a 64-bit property, stored big endian.
    ///
    /// # Errors
    /// See [`set_property`](Self::set_property).
    pub fn set_property_u64(&mut self, node: Node, name: &str, value: u64) -> Result<(), FdtError> {
        self.set_property(node, name, &value.to_be_bytes())
    }

    fn header(&self, field: usize) -> usize {
        be32(self.blob, field) as usize
    }

    fn set_header(&mut self, field: usize, value: usize) -> Result<(), FdtError> {
        let value = u32::try_from(value).map_err(|_| FdtError::BadLayout)?;
        put_be32(self.blob, field, value);
        Ok(())
    }

    fn strings_end(&self) -> usize {
        self.header(field::OFF_DT_STRINGS) + self.header(field::SIZE_DT_STRINGS)
    }

    fn struct_u32(&self, offset: usize) -> Result<u32, FdtError> {
        if offset + 4 > self.header(field::SIZE_DT_STRUCT) {
            return Err(FdtError::BadStructure);
        }
        Ok(be32(self.blob, self.header(field::OFF_DT_STRUCT) + offset))
    }

    /// NUL-terminated name starting at `offset` in the structure block.
    fn name_at(&self, offset: usize) -> Result<&[u8], FdtError> {
        let start = self.header(field::OFF_DT_STRUCT);
        let end = start + self.header(field::SIZE_DT_STRUCT);
        let bytes = self
            .blob
            .get(start + offset..end)
            .ok_or(FdtError::BadStructure)?;
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::BadStructure)?;
        Ok(&bytes[..nul])
    }

    fn string_at(&self, name_offset: u32) -> Result<&[u8], FdtError> {
        let name_offset = name_offset as usize;
        let size = self.header(field::SIZE_DT_STRINGS);
        if name_offset >= size {
            return Err(FdtError::BadStructure);
        }
        let start = self.header(field::OFF_DT_STRINGS);
        let bytes = &self.blob[start + name_offset..start + size];
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::BadStructure)?;
        Ok(&bytes[..nul])
    }

    /// Decodes the token at `offset`, returning its tag and the offset of the next token.
    fn token(&self, offset: usize) -> Result<(u32, usize), FdtError> {
        let tag = self.struct_u32(offset)?;
        let next = match tag {
            FDT_BEGIN_NODE => align4(offset + 4 + self.name_at(offset + 4)?.len() + 1),
            FDT_PROP => {
                let len = self.struct_u32(offset + 4)? as usize;
                self.struct_u32(offset + 8)?;
                align4(offset + 12 + len)
            }
            FDT_END_NODE | FDT_NOP | FDT_END => offset + 4,
            _ => return Err(FdtError::BadStructure),
        };
        if next > self.header(field::SIZE_DT_STRUCT) {
            return Err(FdtError::BadStructure);
        }
        Ok((tag, next))
    }

    /// Offset of the first token after the node's name.
    fn node_body(&self, node: Node) -> Result<usize, FdtError> {
        if node.0 % 4 != 0 {
            return Err(FdtError::BadOffset);
        }
        match self.token(node.0)? {
            (FDT_BEGIN_NODE, next) => Ok(next),
            _ => Err(FdtError::BadOffset),
        }
    }

    /// Offset of the first token after the node's properties.
    fn first_non_property(&self, node: Node) -> Result<usize, FdtError> {
        let mut offset = self.node_body(node)?;
        loop {
            match self.token(offset)? {
                (FDT_PROP | FDT_NOP, next) => offset = next,
                _ => return Ok(offset),
            }
        }
    }

    fn find_property(&self, node: Node, name: &str) -> Result<Option<usize>, FdtError> {
        let mut offset = self.node_body(node)?;
        loop {
            let (tag, next) = self.token(offset)?;
            match tag {
                FDT_PROP => {
                    if self.string_at(self.struct_u32(offset + 8)?)? == name.as_bytes() {
                        return Ok(Some(offset));
                    }
                }
                FDT_NOP => {}
                _ => return Ok(None),
            }
            offset = next;
        }
    }

    fn find_or_add_string(&mut self, name: &str) -> Result<u32, FdtError> {
        let start = self.header(field::OFF_DT_STRINGS);
        let size = self.header(field::SIZE_DT_STRINGS);
        let needle = name.as_bytes();

        let existing = self.blob[start..start + size]
            .windows(needle.len() + 1)
            .position(|w| &w[..needle.len()] == needle && w[needle.len()] == 0);
        if let Some(pos) = existing {
            return u32::try_from(pos).map_err(|_| FdtError::BadLayout);
        }

        let end = start + size;
        if end + needle.len() + 1 > self.total_size() {
            return Err(FdtError::NoSpace);
        }
        self.blob[end..end + needle.len()].copy_from_slice(needle);
        self.blob[end + needle.len()] = 0;
        self.set_header(field::SIZE_DT_STRINGS, size + needle.len() + 1)?;
        u32::try_from(size).map_err(|_| FdtError::BadLayout)
    }

    /// Replaces `old_len` bytes at `offset` in the structure block by `new_len`
    /// bytes of unspecified content, moving everything behind them.
    fn make_room(&mut self, offset: usize, old_len: usize, new_len: usize) -> Result<(), FdtError> {
        let off_struct = self.header(field::OFF_DT_STRUCT);
        let size_struct = self.header(field::SIZE_DT_STRUCT);
        let off_strings = self.header(field::OFF_DT_STRINGS);
        let strings_end = self.strings_end();

        if offset + old_len > size_struct {
            return Err(FdtError::BadOffset);
        }

        let from = off_struct + offset + old_len;
        if new_len > old_len {
            let grow = new_len - old_len;
            if strings_end + grow > self.total_size() {
                return Err(FdtError::NoSpace);
            }
            self.blob.copy_within(from..strings_end, from + grow);
            self.set_header(field::SIZE_DT_STRUCT, size_struct + grow)?;
            self.set_header(field::OFF_DT_STRINGS, off_strings + grow)?;
        } else if old_len > new_len {
            let shrink = old_len - new_len;
            self.blob.copy_within(from..strings_end, from - shrink);
            self.blob[strings_end - shrink..strings_end].fill(0);
            self.set_header(field::SIZE_DT_STRUCT, size_struct - shrink)?;
            self.set_header(field::OFF_DT_STRINGS, off_strings - shrink)?;
        }
        Ok(())
    }
}
