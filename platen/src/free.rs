use std::mem;

use crate::{Handle, MemoryError, MemoryFile};

/// Relocation-table index of the entry anchoring the free list.
pub(crate) const FREE_HEAD: Handle = Handle(0);

/// Freed regions are chained through their own first bytes.
pub(crate) const LINK_SIZE: u32 = mem::size_of::<u32>() as u32;

impl MemoryFile {
    /// Install the distinguished entry that anchors the free list. Runs
    /// on the empty arena so the head lands at table index 0, address 0,
    /// with its link already zeroed.
    pub(crate) fn init_free_list(&mut self) {
        debug_assert!(self.table_len() == 0 && self.arena_len() == 0);
        self.seed_head_entry(LINK_SIZE);
    }

    /// Allocate `size` bytes, first-fit reusing a freed region (and its
    /// table entry) before carving fresh arena space.
    pub fn alloc(&mut self, size: u32) -> Result<Handle, MemoryError> {
        let mut prev = FREE_HEAD;
        let mut cur = Handle(self.read_value::<u32>(FREE_HEAD, 0)?);
        while !cur.is_none() {
            let entry = self.entry(cur)?;
            let next = self.read_value::<u32>(cur, 0)?;
            if entry.size >= size {
                self.write_value::<u32>(prev, 0, next)?;
                // resize to the request; slack past it is unreachable until
                // a collection rebuilds the list
                self.entry_mut(cur)?.size = size;
                log::trace!("alloc {size}: reusing ent {}", cur.index());
                return Ok(cur);
            }
            prev = cur;
            cur = Handle(next);
        }
        self.allocate_table_entry(size)
    }

    /// Return a region to the free list. The bytes are not scrubbed; only
    /// the table entry becomes available for reuse.
    pub fn free(&mut self, handle: Handle) -> Result<(), MemoryError> {
        if handle.is_none() {
            return Err(MemoryError::BadHandle);
        }
        let entry = self.entry(handle)?;
        if entry.size < LINK_SIZE {
            // too small to carry a link; unreachable until compaction
            log::trace!("free ent {}: {} bytes dropped", handle.index(), entry.size);
            return Ok(());
        }
        let head = self.read_value::<u32>(FREE_HEAD, 0)?;
        self.write_value::<u32>(handle, 0, head)?;
        self.write_value::<u32>(FREE_HEAD, 0, handle.index())?;
        log::trace!("free ent {}: {} bytes", handle.index(), entry.size);
        Ok(())
    }

    /// Grow-only reallocation: allocate a new region, copy the old
    /// contents, free the old region. The old handle must not be used
    /// afterward.
    pub fn realloc(&mut self, old: Handle, new_size: u32) -> Result<Handle, MemoryError> {
        let (_, old_size) = self.resolve(old)?;
        debug_assert!(new_size >= old_size, "realloc only grows");
        let mut carried = vec![0u8; old_size as usize];
        self.read(old, 0, &mut carried)?;
        let new = self.alloc(new_size)?;
        self.write(new, 0, &carried)?;
        self.free(old)?;
        Ok(new)
    }

    /// Log the free-list chain at debug level.
    pub fn dump_free_list(&self) {
        let mut cur = match self.read_value::<u32>(FREE_HEAD, 0) {
            Ok(head) => Handle(head),
            Err(err) => {
                log::debug!("free list unreadable: {err}");
                return;
            }
        };
        log::debug!("free list:");
        while !cur.is_none() {
            match (self.entry(cur), self.read_value::<u32>(cur, 0)) {
                (Ok(entry), Ok(next)) => {
                    log::debug!(
                        "  ent {} at {} ({} bytes)",
                        cur.index(),
                        entry.address,
                        entry.size
                    );
                    cur = Handle(next);
                }
                _ => {
                    log::debug!("  broken link at ent {}", cur.index());
                    return;
                }
            }
        }
    }
}
