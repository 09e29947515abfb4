//! Allocation entry points
//!
//! Calls without a context argument go to the calling thread's current
//! context. Pointer-taking calls recover the owning context from the chunk
//! header, so callers never need to remember where a chunk came from.

use core::ptr::NonNull;

use crate::context::{current_memory_context, top_most_memory_context, MemoryContext};
use crate::error::MemoryError;
use crate::header::get_memory_chunk_context;

/// Allocate `size` bytes in the current context
#[inline]
pub fn palloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    current_memory_context().alloc(size)
}

/// Allocate `size` zeroed bytes in the current context
#[inline]
pub fn palloc0(size: usize) -> Result<NonNull<u8>, MemoryError> {
    current_memory_context().alloc_zeroed(size)
}

/// Copy `text` plus a NUL terminator into the current context
pub fn pstrdup(text: &str) -> Result<NonNull<u8>, MemoryError> {
    current_memory_context().strdup(text)
}

/// Copy at most `len` bytes of `bytes`, stopping early at a NUL, and
/// terminate the copy
pub fn pnstrdup(bytes: &[u8], len: usize) -> Result<NonNull<u8>, MemoryError> {
    let limit = len.min(bytes.len());
    let end = bytes[..limit].iter().position(|&b| b == 0).unwrap_or(limit);

    current_memory_context().strndup(&bytes[..end])
}

/// Allocate `size` bytes in the top-most context
pub fn alloc_top(size: usize) -> Result<NonNull<u8>, MemoryError> {
    top_most_memory_context().alloc(size)
}

/// Free a chunk, wherever it was allocated.
///
/// # Safety
/// `pointer` must be a live chunk returned by one of the allocation calls
/// and must not be used afterwards.
pub unsafe fn pfree(pointer: NonNull<u8>) {
    get_memory_chunk_context(pointer).free_chunk(pointer);
}

/// Resize a chunk within its owning context; the chunk may move.
///
/// On error the original chunk is untouched.
///
/// # Safety
/// `pointer` must be a live chunk returned by one of the allocation calls.
/// On success it must no longer be used unless it equals the result.
pub unsafe fn repalloc(pointer: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
    get_memory_chunk_context(pointer).realloc_chunk(pointer, size)
}

/// Allocation entry points for generic container code
pub struct GenAlloc {
    pub alloc: fn(&MemoryContext, usize) -> Result<NonNull<u8>, MemoryError>,
    pub alloc0: fn(&MemoryContext, usize) -> Result<NonNull<u8>, MemoryError>,
    pub realloc: unsafe fn(NonNull<u8>, usize) -> Result<NonNull<u8>, MemoryError>,
    pub free: unsafe fn(NonNull<u8>),
    pub current_context: fn() -> MemoryContext,
    pub alloc_top: fn(usize) -> Result<NonNull<u8>, MemoryError>,
}

pub static GEN_ALLOC: GenAlloc = GenAlloc {
    alloc: MemoryContext::alloc,
    alloc0: MemoryContext::alloc_zeroed,
    realloc: repalloc,
    free: pfree,
    current_context: current_memory_context,
    alloc_top,
};
