//! Chunk header protocol - owner back-reference prefixed to every chunk
//!
//! Design: Fixed-size header immediately before the user pointer:
//! - O(1) owner recovery by subtracting `CHUNK_HEADER_SIZE`
//! - Max-aligned so the user pointer keeps platform alignment
//! - Size field doubles as a plausibility check for bogus pointers
//!
//! ```text
//!   ┌──────────────────────────┬──────────────────────────────┐
//!   │ ChunkHeader              │ user data (size bytes)       │
//!   │  context: *ContextNode   │                              │
//!   │  size:    usize          │                              │
//!   └──────────────────────────┴──────────────────────────────┘
//!                              ▲
//!                              └── pointer handed to callers
//! ```
//!
//! Recovery is a heuristic: a foreign pointer with plausible alignment and a
//! plausible size word in front of it can be mistaken for a chunk.

use core::mem;
use core::ptr::NonNull;

use crate::context::{ContextNode, MemoryContext};
use crate::error::fatal_assert;

/// Platform maximum alignment for chunk pointers
pub const MAXIMUM_ALIGNOF: usize = 8;

/// Largest legal request size (1 GiB - 1)
pub const MAX_ALLOC_SIZE: usize = 0x3fff_ffff;

/// Space reserved in front of every chunk
pub const CHUNK_HEADER_SIZE: usize = max_align(mem::size_of::<ChunkHeader>());

/// Round `len` up to the platform maximum alignment
#[inline(always)]
pub const fn max_align(len: usize) -> usize {
    (len.wrapping_add(MAXIMUM_ALIGNOF - 1)) & !(MAXIMUM_ALIGNOF - 1)
}

/// Whether `size` is a legal allocation request
#[inline(always)]
pub const fn alloc_size_is_valid(size: usize) -> bool {
    size <= MAX_ALLOC_SIZE
}

#[inline(always)]
pub(crate) fn is_max_aligned(pointer: *const u8) -> bool {
    pointer as usize & (MAXIMUM_ALIGNOF - 1) == 0
}

/// Header prefixed to every allocated chunk
#[repr(C, align(8))]
#[derive(Debug)]
pub struct ChunkHeader {
    context: NonNull<ContextNode>,
    size: usize,
}

impl ChunkHeader {
    #[inline]
    pub const fn new(context: NonNull<ContextNode>, size: usize) -> Self {
        Self { context, size }
    }

    /// Owning context node
    #[inline]
    pub fn context(&self) -> NonNull<ContextNode> {
        self.context
    }

    /// Usable size of the chunk (excluding the header)
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Write a header at `chunk` and return the user pointer following it.
    ///
    /// # Safety
    /// `chunk` must be max-aligned and valid for writes of
    /// `CHUNK_HEADER_SIZE + size` bytes.
    #[inline]
    pub unsafe fn install(chunk: NonNull<u8>, context: NonNull<ContextNode>, size: usize) -> NonNull<u8> {
        debug_assert!(is_max_aligned(chunk.as_ptr()), "unaligned chunk");

        chunk.as_ptr().cast::<ChunkHeader>().write(Self::new(context, size));
        NonNull::new_unchecked(chunk.as_ptr().add(CHUNK_HEADER_SIZE))
    }

    /// Header location for a user pointer (no validation).
    ///
    /// # Safety
    /// `pointer` must have been returned by `install`.
    #[inline]
    pub unsafe fn from_pointer(pointer: NonNull<u8>) -> NonNull<ChunkHeader> {
        NonNull::new_unchecked(pointer.as_ptr().sub(CHUNK_HEADER_SIZE).cast::<ChunkHeader>())
    }

    /// Start of the chunk (header included) for a user pointer.
    ///
    /// # Safety
    /// Same as `from_pointer`.
    #[inline]
    pub unsafe fn chunk_start(pointer: NonNull<u8>) -> NonNull<u8> {
        Self::from_pointer(pointer).cast::<u8>()
    }

    /// Update the recorded size after an in-place resize.
    ///
    /// # Safety
    /// `pointer` must have been returned by `install` and the chunk must
    /// really have room for `size` bytes.
    #[inline]
    pub unsafe fn set_size(pointer: NonNull<u8>, size: usize) {
        (*Self::from_pointer(pointer).as_ptr()).size = size;
    }
}

/// Validate a pointer handed to a mutating operation and read its header.
///
/// Misaligned pointers are fatal: continuing would corrupt memory.
///
/// # Safety
/// `pointer` must point just past a readable `ChunkHeader`.
pub(crate) unsafe fn checked_header<'a>(pointer: NonNull<u8>) -> &'a ChunkHeader {
    fatal_assert!(
        is_max_aligned(pointer.as_ptr()),
        "pointer {:p} is not a memory chunk (misaligned)",
        pointer.as_ptr()
    );

    &*ChunkHeader::from_pointer(pointer).as_ptr()
}

/// Recover the context that owns `pointer`.
///
/// # Safety
/// `pointer` must be a live chunk returned by an allocation call.
pub unsafe fn get_memory_chunk_context(pointer: NonNull<u8>) -> MemoryContext {
    let header = checked_header(pointer);
    MemoryContext::from_node_ptr(header.context())
}

/// Total space occupied by the chunk at `pointer`, header and padding included.
///
/// # Safety
/// `pointer` must be a live chunk returned by an allocation call.
pub unsafe fn get_memory_chunk_space(pointer: NonNull<u8>) -> usize {
    get_memory_chunk_context(pointer).chunk_space(pointer)
}

/// Advisory membership test used by `MemoryContext::contains`.
///
/// # Safety
/// When `pointer` is non-null and aligned, the `CHUNK_HEADER_SIZE` bytes in
/// front of it must be readable.
pub(crate) unsafe fn header_matches(context: NonNull<ContextNode>, pointer: *const u8) -> bool {
    if pointer.is_null() || !is_max_aligned(pointer) {
        return false;
    }

    let header = &*pointer.sub(CHUNK_HEADER_SIZE).cast::<ChunkHeader>();
    header.context == context && alloc_size_is_valid(header.size)
}
