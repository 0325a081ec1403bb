use std::mem;

use crate::{Blob, Handle, MemoryFile, OBJECT_SIZE, Object, VmError};

/// Objects per segment. Small enough that chain growth is exercised by
/// ordinary workloads.
pub const SEGMENT_CAPACITY: u32 = 10;

const HEADER_SIZE: u32 = mem::size_of::<SegmentHeader>() as u32;
const SEGMENT_BYTES: u32 = HEADER_SIZE + SEGMENT_CAPACITY * OBJECT_SIZE as u32;

/// Per-segment bookkeeping, resident in the arena ahead of the slot array.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct SegmentHeader {
    next: Handle,
    top: u32,
}

// SAFETY: two 4-byte fields, no padding, any bits valid
unsafe impl Blob for SegmentHeader {}

fn slot_offset(index: u32) -> u32 {
    HEADER_SIZE + index * OBJECT_SIZE as u32
}

fn new_segment(mem: &mut MemoryFile) -> Result<Handle, VmError> {
    let seg = mem.alloc(SEGMENT_BYTES)?;
    mem.write_value(
        seg,
        0,
        SegmentHeader {
            next: Handle::NONE,
            top: 0,
        },
    )?;
    Ok(seg)
}

/// A stack of [`Object`]s stored as a linked chain of fixed-size segments
/// inside the managed memory file. The wrapper holds only the handle of the
/// first segment; all state lives in the arena, so stacks survive arena
/// relocation and can be passed between contexts by handle.
///
/// Only the terminal segment is partially full. A segment drained by `pop`
/// is kept linked as a spare rather than freed, so push/pop traffic across
/// a boundary does not churn the allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegStack {
    first: Handle,
}

impl SegStack {
    pub fn create(mem: &mut MemoryFile) -> Result<Self, VmError> {
        Ok(Self {
            first: new_segment(mem)?,
        })
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.first
    }

    #[must_use]
    pub fn from_handle(first: Handle) -> Self {
        Self { first }
    }

    /// Last segment holding any elements. With an empty stack this is the
    /// first segment.
    fn terminal_used(&self, mem: &MemoryFile) -> Result<(Handle, SegmentHeader), VmError> {
        let mut seg = self.first;
        loop {
            let header: SegmentHeader = mem.read_value(seg, 0)?;
            if !header.next.is_none() {
                let ahead: SegmentHeader = mem.read_value(header.next, 0)?;
                if ahead.top > 0 {
                    seg = header.next;
                    continue;
                }
            }
            return Ok((seg, header));
        }
    }

    /// Locate the slot `i` places down from the top. The walk keeps the
    /// segment behind the terminal one at hand, so indexes past the
    /// terminal elements back up into that full segment the way the
    /// terminal walk's caller expects. Anything deeper reports underflow
    /// even when the chain holds more elements.
    fn slot_from_top(&self, mem: &MemoryFile, i: usize) -> Result<(Handle, u32), VmError> {
        let mut prev = Handle::NONE;
        let mut seg = self.first;
        let mut header: SegmentHeader = mem.read_value(seg, 0)?;
        while !header.next.is_none() {
            let ahead: SegmentHeader = mem.read_value(header.next, 0)?;
            if ahead.top == 0 {
                break;
            }
            prev = seg;
            seg = header.next;
            header = ahead;
        }
        if i < header.top as usize {
            return Ok((seg, slot_offset(header.top - 1 - i as u32)));
        }
        // every non-terminal segment is full, so the element sits a fixed
        // distance from the previous segment's end
        let back = i - header.top as usize;
        if !prev.is_none() && back < SEGMENT_CAPACITY as usize {
            return Ok((prev, slot_offset(SEGMENT_CAPACITY - 1 - back as u32)));
        }
        Err(VmError::StackUnderflow)
    }

    pub fn push(&self, mem: &mut MemoryFile, object: Object) -> Result<(), VmError> {
        let mut seg = self.first;
        loop {
            let mut header: SegmentHeader = mem.read_value(seg, 0)?;
            if header.top < SEGMENT_CAPACITY {
                // keep the chain extended before committing, so a failed
                // extension leaves the stack untouched
                if header.top + 1 == SEGMENT_CAPACITY && header.next.is_none() {
                    header.next = new_segment(mem)?;
                }
                mem.write_value(seg, slot_offset(header.top), object)?;
                header.top += 1;
                mem.write_value(seg, 0, header)?;
                return Ok(());
            }
            if header.next.is_none() {
                header.next = new_segment(mem)?;
                mem.write_value(seg, 0, header)?;
            }
            seg = header.next;
        }
    }

    /// Remove and return the top object, or the invalid sentinel when the
    /// stack is empty. Drained segments stay linked as spares.
    pub fn pop(&self, mem: &mut MemoryFile) -> Result<Object, VmError> {
        let (seg, mut header) = self.terminal_used(mem)?;
        if header.top == 0 {
            return Ok(Object::invalid());
        }
        header.top -= 1;
        let object = mem.read_value(seg, slot_offset(header.top))?;
        mem.write_value(seg, 0, header)?;
        Ok(object)
    }

    /// Read the element `i` places down from the top. The window covers
    /// the terminal segment plus the full segment behind it; deeper
    /// indexes report underflow even when the chain holds more elements.
    pub fn fetch(&self, mem: &MemoryFile, i: usize) -> Result<Object, VmError> {
        let (seg, offset) = self.slot_from_top(mem, i)?;
        Ok(mem.read_value(seg, offset)?)
    }

    /// Overwrite the element `i` places down from the top. Same window as
    /// [`SegStack::fetch`].
    pub fn store(&self, mem: &mut MemoryFile, i: usize, object: Object) -> Result<(), VmError> {
        let (seg, offset) = self.slot_from_top(mem, i)?;
        Ok(mem.write_value(seg, offset, object)?)
    }

    /// Read the element `i` places up from the bottom. Unlike the top-down
    /// accessors this walks the chain, so it reaches any depth.
    pub fn fetch_bottom(&self, mem: &MemoryFile, i: usize) -> Result<Object, VmError> {
        let mut seg = self.first;
        let mut i = i;
        loop {
            let header: SegmentHeader = mem.read_value(seg, 0)?;
            if i < header.top as usize {
                return Ok(mem.read_value(seg, slot_offset(i as u32))?);
            }
            if header.top < SEGMENT_CAPACITY || header.next.is_none() {
                return Err(VmError::StackUnderflow);
            }
            i -= SEGMENT_CAPACITY as usize;
            seg = header.next;
        }
    }

    pub fn depth(&self, mem: &MemoryFile) -> Result<usize, VmError> {
        let mut seg = self.first;
        let mut total = 0usize;
        loop {
            let header: SegmentHeader = mem.read_value(seg, 0)?;
            total += header.top as usize;
            if header.top < SEGMENT_CAPACITY || header.next.is_none() {
                return Ok(total);
            }
            seg = header.next;
        }
    }

    /// Drop every element. Segments stay allocated and linked as spares;
    /// the bytes are not scrubbed, reads are gated on `top`.
    pub fn clear(&self, mem: &mut MemoryFile) -> Result<(), VmError> {
        let mut seg = self.first;
        while !seg.is_none() {
            let mut header: SegmentHeader = mem.read_value(seg, 0)?;
            header.top = 0;
            mem.write_value(seg, 0, header)?;
            seg = header.next;
        }
        Ok(())
    }

    /// Return the whole segment chain to the allocator. The stack must not
    /// be used afterward.
    pub fn destroy(&mut self, mem: &mut MemoryFile) -> Result<(), VmError> {
        let mut seg = self.first;
        self.first = Handle::NONE;
        while !seg.is_none() {
            let header: SegmentHeader = mem.read_value(seg, 0)?;
            mem.free(seg)?;
            seg = header.next;
        }
        Ok(())
    }

    /// Log the contents bottom to top at debug level.
    pub fn dump(&self, mem: &MemoryFile) {
        let depth = match self.depth(mem) {
            Ok(depth) => depth,
            Err(err) => {
                log::debug!("stack ent {} unreadable: {err}", self.first.index());
                return;
            }
        };
        log::debug!("stack ent {} ({depth} deep):", self.first.index());
        for i in 0..depth {
            match self.fetch_bottom(mem, i) {
                Ok(object) => log::debug!("  {i}: {object}"),
                Err(err) => {
                    log::debug!("  {i}: unreadable: {err}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCreateInfo;

    fn memory() -> MemoryFile {
        MemoryFile::new(&MemoryCreateInfo::default())
    }

    #[test]
    fn pop_reverses_push_order_and_bottoms_out_invalid() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        for value in [1, 2, 3] {
            stack.push(&mut mem, Object::integer(value)).unwrap();
        }
        assert_eq!(stack.pop(&mut mem).unwrap().as_integer(), Some(3));
        assert_eq!(stack.pop(&mut mem).unwrap().as_integer(), Some(2));
        assert_eq!(stack.pop(&mut mem).unwrap().as_integer(), Some(1));
        assert!(stack.pop(&mut mem).unwrap().is_invalid());
        assert!(
            stack.pop(&mut mem).unwrap().is_invalid(),
            "stays empty, no underflow error from pop"
        );
    }

    #[test]
    fn depth_counts_across_segment_boundaries() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        let deep = SEGMENT_CAPACITY as usize * 2 + 5;
        for value in 0..deep {
            stack.push(&mut mem, Object::integer(value as i64)).unwrap();
        }
        assert_eq!(stack.depth(&mem).unwrap(), deep);
        for value in (0..deep).rev() {
            assert_eq!(
                stack.pop(&mut mem).unwrap().as_integer(),
                Some(value as i64)
            );
        }
        assert_eq!(stack.depth(&mem).unwrap(), 0);
    }

    #[test]
    fn fetch_and_store_address_from_the_top() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        for value in [10, 20, 30] {
            stack.push(&mut mem, Object::integer(value)).unwrap();
        }
        assert_eq!(stack.fetch(&mem, 0).unwrap().as_integer(), Some(30));
        assert_eq!(stack.fetch(&mem, 2).unwrap().as_integer(), Some(10));
        stack.store(&mut mem, 1, Object::integer(99)).unwrap();
        assert_eq!(stack.fetch(&mem, 1).unwrap().as_integer(), Some(99));
        assert_eq!(stack.depth(&mem).unwrap(), 3, "store does not change depth");
    }

    #[test]
    fn fetch_past_depth_is_underflow() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        stack.push(&mut mem, Object::integer(1)).unwrap();
        assert_eq!(stack.fetch(&mem, 1), Err(VmError::StackUnderflow));
        assert_eq!(
            stack.store(&mut mem, 1, Object::mark()),
            Err(VmError::StackUnderflow)
        );
    }

    #[test]
    fn fetch_and_store_reach_into_the_previous_full_segment() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        let deep = SEGMENT_CAPACITY as usize + 5;
        for value in 0..deep {
            stack.push(&mut mem, Object::integer(value as i64)).unwrap();
        }
        // terminal segment holds 5; index 5 crosses into the full one
        assert_eq!(stack.fetch(&mem, 4).unwrap().as_integer(), Some(10));
        assert_eq!(stack.fetch(&mem, 5).unwrap().as_integer(), Some(9));
        assert_eq!(stack.fetch(&mem, 14).unwrap().as_integer(), Some(0));
        stack.store(&mut mem, 12, Object::integer(99)).unwrap();
        assert_eq!(stack.fetch(&mem, 12).unwrap().as_integer(), Some(99));
        assert_eq!(stack.fetch_bottom(&mem, 2).unwrap().as_integer(), Some(99));
        assert_eq!(stack.fetch(&mem, deep), Err(VmError::StackUnderflow));
    }

    #[test]
    fn top_down_window_stops_one_full_segment_back() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        let deep = SEGMENT_CAPACITY as usize * 2 + 5;
        for value in 0..deep {
            stack.push(&mut mem, Object::integer(value as i64)).unwrap();
        }
        let window = SEGMENT_CAPACITY as usize + 5;
        assert_eq!(
            stack.fetch(&mem, window - 1).unwrap().as_integer(),
            Some((deep - window) as i64)
        );
        assert_eq!(
            stack.fetch(&mem, window),
            Err(VmError::StackUnderflow),
            "the window ends one full segment down, not at the chain depth"
        );
    }

    #[test]
    fn fetch_bottom_reaches_past_the_terminal_segment() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        let deep = SEGMENT_CAPACITY as usize + 3;
        for value in 0..deep {
            stack.push(&mut mem, Object::integer(value as i64)).unwrap();
        }
        assert_eq!(stack.fetch_bottom(&mem, 0).unwrap().as_integer(), Some(0));
        assert_eq!(
            stack
                .fetch_bottom(&mem, SEGMENT_CAPACITY as usize)
                .unwrap()
                .as_integer(),
            Some(SEGMENT_CAPACITY as i64)
        );
        assert_eq!(
            stack.fetch_bottom(&mem, deep),
            Err(VmError::StackUnderflow)
        );
    }

    #[test]
    fn clear_empties_but_keeps_segments_usable() {
        let mut mem = memory();
        let stack = SegStack::create(&mut mem).unwrap();
        for value in 0..SEGMENT_CAPACITY as i64 + 4 {
            stack.push(&mut mem, Object::integer(value)).unwrap();
        }
        let table_before = mem.table_len();
        stack.clear(&mut mem).unwrap();
        assert_eq!(stack.depth(&mem).unwrap(), 0);
        assert!(stack.pop(&mut mem).unwrap().is_invalid());
        stack.push(&mut mem, Object::integer(7)).unwrap();
        assert_eq!(stack.fetch(&mem, 0).unwrap().as_integer(), Some(7));
        assert_eq!(
            mem.table_len(),
            table_before,
            "clear keeps the chain, no segment traffic"
        );
    }

    #[test]
    fn transfer_between_stacks_reverses_order() {
        let mut mem = memory();
        let source = SegStack::create(&mut mem).unwrap();
        let sink = SegStack::create(&mut mem).unwrap();
        for value in [2, 12, 0xF00] {
            source.push(&mut mem, Object::integer(value)).unwrap();
        }
        loop {
            let object = source.pop(&mut mem).unwrap();
            if object.is_invalid() {
                break;
            }
            sink.push(&mut mem, object).unwrap();
        }
        assert_eq!(sink.pop(&mut mem).unwrap().as_integer(), Some(2));
        assert_eq!(sink.pop(&mut mem).unwrap().as_integer(), Some(12));
        assert_eq!(sink.pop(&mut mem).unwrap().as_integer(), Some(0xF00));
    }

    #[test]
    fn destroy_returns_segments_for_reuse() {
        let mut mem = memory();
        let mut stack = SegStack::create(&mut mem).unwrap();
        for value in 0..SEGMENT_CAPACITY as i64 * 2 {
            stack.push(&mut mem, Object::integer(value)).unwrap();
        }
        let table_before = mem.table_len();
        let arena_before = mem.arena_len();
        stack.destroy(&mut mem).unwrap();

        let replacement = SegStack::create(&mut mem).unwrap();
        for value in 0..SEGMENT_CAPACITY as i64 * 2 {
            replacement.push(&mut mem, Object::integer(value)).unwrap();
        }
        assert_eq!(mem.table_len(), table_before, "freed entries were reused");
        assert_eq!(mem.arena_len(), arena_before, "no fresh arena space carved");
    }
}
