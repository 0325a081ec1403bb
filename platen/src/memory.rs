use std::{fmt, mem, ptr};

pub const DEFAULT_INITIAL_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Stable logical reference to a managed allocation: an index into the
/// relocation table, never a raw arena offset. A handle survives arena
/// growth and compaction; a raw offset does not.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    /// Table index 0 is claimed by the free-list head at init, so 0 doubles
    /// as the null link in arena-resident chains.
    pub const NONE: Handle = Handle(0);

    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    OutOfMemory,
    AddressRange,
    BadHandle,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => f.write_str("arena cannot grow"),
            MemoryError::AddressRange => f.write_str("access outside entry bounds"),
            MemoryError::BadHandle => f.write_str("handle has no table entry"),
        }
    }
}

/// Marker for plain-data values that may live inside the arena.
///
/// # Safety
/// Every bit pattern of the implementing type must be a valid value, and the
/// type must contain no padding bytes.
pub unsafe trait Blob: Copy {}

// SAFETY: primitive integers accept any bit pattern and have no padding
unsafe impl Blob for u8 {}
// SAFETY: as above
unsafe impl Blob for u32 {}
// SAFETY: as above
unsafe impl Blob for u64 {}
// SAFETY: as above
unsafe impl Blob for i64 {}
// SAFETY: repr(transparent) over u32
unsafe impl Blob for Handle {}

#[derive(Debug, Clone, Default)]
pub struct MemoryCreateInfo {
    pub initial_size: Option<usize>,
    /// hard ceiling on arena growth; allocations past it fail
    pub max_size: Option<usize>,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct TableEntry {
    pub address: u32,
    pub size: u32,
}

/// The managed memory file: a single growable byte arena plus the relocation
/// table mapping stable handles to current physical extents. Everything else
/// in the system addresses memory through handles; the only operation that
/// yields a raw offset is [`MemoryFile::resolve`], and that offset dies at
/// the next allocation event.
#[derive(Debug)]
pub struct MemoryFile {
    arena: Vec<u8>,
    limit: usize,
    table: Vec<TableEntry>,
}

impl MemoryFile {
    pub fn new(info: &MemoryCreateInfo) -> Self {
        let initial = info.initial_size.unwrap_or(DEFAULT_INITIAL_SIZE);
        // the free-list head always fits, whatever ceiling the caller set
        let limit = info
            .max_size
            .unwrap_or(DEFAULT_MAX_SIZE)
            .max(crate::free::LINK_SIZE as usize);
        let mut mem = Self {
            arena: Vec::with_capacity(initial.min(limit)),
            limit,
            table: Vec::new(),
        };
        mem.init_free_list();
        mem
    }

    /// Place the table's first entry over the start of the empty arena.
    /// Only free-list initialization uses this.
    pub(crate) fn seed_head_entry(&mut self, size: u32) {
        self.arena.resize(size as usize, 0);
        self.table.push(TableEntry { address: 0, size });
    }

    pub(crate) fn entry(&self, handle: Handle) -> Result<TableEntry, MemoryError> {
        self.table
            .get(handle.0 as usize)
            .copied()
            .ok_or(MemoryError::BadHandle)
    }

    pub(crate) fn entry_mut(&mut self, handle: Handle) -> Result<&mut TableEntry, MemoryError> {
        self.table
            .get_mut(handle.0 as usize)
            .ok_or(MemoryError::BadHandle)
    }

    /// Carve fresh bytes off the end of the arena, growing it if the limit
    /// allows. Growing may move the whole backing buffer; offsets stay
    /// valid, raw pointers into the arena do not.
    fn carve(&mut self, size: u32) -> Result<u32, MemoryError> {
        let address = (self.arena.len() + 7) & !7;
        let end = address + size as usize;
        if end > self.limit {
            log::warn!(
                "arena limit reached: want {size} bytes at {address}, limit {}",
                self.limit
            );
            return Err(MemoryError::OutOfMemory);
        }
        self.arena.resize(end, 0);
        Ok(address as u32)
    }

    /// Create a new indirection entry backed by `size` fresh bytes.
    pub fn allocate_table_entry(&mut self, size: u32) -> Result<Handle, MemoryError> {
        let address = self.carve(size)?;
        let index = self.table.len() as u32;
        self.table.push(TableEntry { address, size });
        log::trace!("ent {index}: {size} bytes at {address}");
        Ok(Handle(index))
    }

    /// Resolve a handle to its current `(offset, size)` extent. The offset
    /// is valid only until the next allocation, free or grow event; callers
    /// must not cache it.
    pub fn resolve(&self, handle: Handle) -> Result<(u32, u32), MemoryError> {
        let e = self.entry(handle)?;
        Ok((e.address, e.size))
    }

    fn span(&self, handle: Handle, offset: u32, len: usize) -> Result<usize, MemoryError> {
        let e = self.entry(handle)?;
        if offset as usize + len > e.size as usize {
            return Err(MemoryError::AddressRange);
        }
        Ok(e.address as usize + offset as usize)
    }

    pub fn read(&self, handle: Handle, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let at = self.span(handle, offset, buf.len())?;
        buf.copy_from_slice(&self.arena[at..at + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, handle: Handle, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
        let at = self.span(handle, offset, data.len())?;
        self.arena[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_value<T: Blob>(&self, handle: Handle, offset: u32) -> Result<T, MemoryError> {
        let at = self.span(handle, offset, mem::size_of::<T>())?;
        // SAFETY: the span is bounds-checked and T is Blob, so any bytes
        // form a valid value; unaligned read because entries are only
        // 8-byte aligned
        Ok(unsafe { ptr::read_unaligned(self.arena.as_ptr().add(at).cast::<T>()) })
    }

    pub fn write_value<T: Blob>(
        &mut self,
        handle: Handle,
        offset: u32,
        value: T,
    ) -> Result<(), MemoryError> {
        let at = self.span(handle, offset, mem::size_of::<T>())?;
        // SAFETY: bounds-checked span; Blob types are padding-free, so the
        // value's bytes are fully initialized
        unsafe { ptr::write_unaligned(self.arena.as_mut_ptr().add(at).cast::<T>(), value) };
        Ok(())
    }

    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn table_len(&self) -> usize {
        self.table.len()
    }
}
