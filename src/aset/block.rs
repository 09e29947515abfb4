//! Backing blocks - global-allocator memory regions carved into chunks

use std::alloc::{alloc, dealloc, realloc, Layout};
use core::ptr::NonNull;

use crate::header::{is_max_aligned, MAXIMUM_ALIGNOF};

/// One region obtained from the global allocator.
///
/// Chunks are carved front to back; `free_offset` marks the first unused byte.
pub(super) struct Block {
    start: NonNull<u8>,
    layout: Layout,
    free_offset: usize,
}

impl Block {
    /// Allocate a block of `size` bytes, max-aligned
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }

        let layout = Layout::from_size_align(size, MAXIMUM_ALIGNOF).ok()?;
        let start = NonNull::new(unsafe { alloc(layout) })?;

        Some(Self {
            start,
            layout,
            free_offset: 0,
        })
    }

    /// Take `len` bytes from the free end of the block
    #[inline]
    pub fn carve(&mut self, len: usize) -> Option<NonNull<u8>> {
        debug_assert!(len % MAXIMUM_ALIGNOF == 0, "unaligned carve");

        if len > self.remaining() {
            return None;
        }

        let chunk = unsafe { self.start.as_ptr().add(self.free_offset) };
        self.free_offset += len;

        debug_assert!(is_max_aligned(chunk));
        NonNull::new(chunk)
    }

    /// Forget every chunk carved so far
    #[inline]
    pub fn reset(&mut self) {
        self.free_offset = 0;
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.layout.size() - self.free_offset
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.free_offset
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn contains(&self, pointer: *const u8) -> bool {
        let start = self.start.as_ptr() as usize;
        let address = pointer as usize;
        address >= start && address < start + self.layout.size()
    }

    /// Resize the whole block through the global allocator; the block may
    /// move. On failure the block is unchanged.
    pub fn grow(&mut self, new_size: usize) -> bool {
        let Ok(layout) = Layout::from_size_align(new_size, MAXIMUM_ALIGNOF) else {
            return false;
        };

        let Some(start) = NonNull::new(unsafe { realloc(self.start.as_ptr(), self.layout, new_size) }) else {
            return false;
        };

        self.start = start;
        self.layout = layout;
        self.free_offset = new_size;
        true
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.start.as_ptr(), self.layout);
        }
    }
}
