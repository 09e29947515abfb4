//! AllocSet - the general-purpose context strategy
//!
//! Design: Size-classed free lists over blocks from the global allocator:
//! 1. Small requests (≤ 8 KiB) are rounded up to a power of two and served
//!    from the class free list, else carved from the active block
//! 2. Large requests get a dedicated block holding exactly one chunk, handed
//!    back to the global allocator as soon as the chunk is freed
//! 3. Block sizes double from `init_block_size` up to `max_block_size`
//!
//! A keeper block of `min_context_size` bytes is allocated at creation and
//! survives `reset`, so a context can guarantee a reserve.

mod block;


use core::ptr::{self, NonNull};
use serde::{Deserialize, Serialize};

use crate::context::{default_alloc_set_sizes, MemoryContext};
use crate::error::{fatal, fatal_assert, MemoryError};
use crate::header::{max_align, ChunkHeader, CHUNK_HEADER_SIZE, MAX_ALLOC_SIZE};
use crate::methods::{ChunkProblem, ContextInfo, MemoryContextCounters, MemoryContextMethods};
use block::Block;

/// Smallest chunk is `1 << ALLOC_MINBITS` bytes
pub const ALLOC_MINBITS: u32 = 3;
/// Number of size classes
pub const ALLOCSET_NUM_FREELISTS: usize = 11;
/// Largest request served from a size class
pub const ALLOC_CHUNK_LIMIT: usize = 1 << (ALLOCSET_NUM_FREELISTS as u32 - 1 + ALLOC_MINBITS);

/// Smallest legal `init_block_size`
const MIN_BLOCK_SIZE: usize = 1024;

/// Wipe pattern for freed chunks in debug builds
#[cfg(debug_assertions)]
const CLOBBER_BYTE: u8 = 0x7F;

/// Size class index of a small request
#[inline]
pub fn free_index(size: usize) -> usize {
    debug_assert!(size <= ALLOC_CHUNK_LIMIT);

    if size > (1 << ALLOC_MINBITS) {
        (usize::BITS - (size - 1).leading_zeros() - ALLOC_MINBITS) as usize
    } else {
        0
    }
}

/// Chunk size of a size class
#[inline]
pub const fn class_size(index: usize) -> usize {
    1 << (index as u32 + ALLOC_MINBITS)
}

/// Block sizing of one AllocSet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocSetSizes {
    /// Keeper block size; 0 means no keeper
    pub min_context_size: usize,
    /// First block size
    pub init_block_size: usize,
    /// Cap for the doubling block size
    pub max_block_size: usize,
}

impl AllocSetSizes {
    /// Contexts that may grow large
    pub const DEFAULT: Self = Self {
        min_context_size: 0,
        init_block_size: 8 * 1024,
        max_block_size: 8 * 1024 * 1024,
    };

    /// Contexts expected to hold little data
    pub const SMALL: Self = Self {
        min_context_size: 0,
        init_block_size: 1024,
        max_block_size: 8 * 1024,
    };

    /// The top-most context
    pub const TOP: Self = Self {
        min_context_size: 0,
        init_block_size: 8 * 1024,
        max_block_size: 8 * 1024,
    };

    /// The error context: an 8 KiB reserve that is never given back
    pub const ERROR: Self = Self {
        min_context_size: 8 * 1024,
        init_block_size: 8 * 1024,
        max_block_size: 8 * 1024,
    };

    pub fn validate(&self) -> Result<(), String> {
        if self.init_block_size < MIN_BLOCK_SIZE {
            return Err(format!(
                "init_block_size {} is below the minimum of {}",
                self.init_block_size, MIN_BLOCK_SIZE
            ));
        }
        if self.max_block_size < self.init_block_size {
            return Err(format!(
                "max_block_size {} is smaller than init_block_size {}",
                self.max_block_size, self.init_block_size
            ));
        }
        if self.max_block_size > MAX_ALLOC_SIZE || self.min_context_size > MAX_ALLOC_SIZE {
            return Err("block sizes must not exceed the maximum allocation size".to_string());
        }
        Ok(())
    }
}

impl Default for AllocSetSizes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The AllocSet strategy state of one context
pub struct AllocSet {
    sizes: AllocSetSizes,
    /// Small-chunk blocks; the last one is active, the first is the keeper
    /// when `has_keeper`
    blocks: Vec<Block>,
    has_keeper: bool,
    /// Dedicated blocks of large chunks
    large: Vec<Block>,
    freelist: [Vec<NonNull<u8>>; ALLOCSET_NUM_FREELISTS],
    next_block_size: usize,
    is_reset: bool,
}

// Safety: the raw chunk pointers are owned by this AllocSet alone and are
// only dereferenced through `&mut self` or under the owning node's lock.
unsafe impl Send for AllocSet {}

impl AllocSet {
    fn new(sizes: AllocSetSizes) -> Self {
        Self {
            sizes,
            blocks: Vec::new(),
            has_keeper: false,
            large: Vec::new(),
            freelist: Default::default(),
            next_block_size: sizes.init_block_size,
            is_reset: true,
        }
    }

    /// Create a context of this kind.
    ///
    /// Invalid sizes are a programming error and fatal.
    pub fn create(
        parent: Option<&MemoryContext>,
        name: &str,
        sizes: AllocSetSizes,
        shared: bool,
    ) -> Result<MemoryContext, MemoryError> {
        if let Err(msg) = sizes.validate() {
            fatal(format_args!("invalid sizes for context \"{}\": {}", name, msg));
        }

        MemoryContext::create(Box::new(Self::new(sizes)), parent, name, shared)
    }

    /// Private child of `parent` with the configured default sizing
    pub fn create_default(parent: &MemoryContext, name: &str) -> Result<MemoryContext, MemoryError> {
        Self::create(Some(parent), name, default_alloc_set_sizes(), false)
    }

    pub fn sizes(&self) -> AllocSetSizes {
        self.sizes
    }

    fn out_of_memory(context: ContextInfo<'_>, size: usize) -> MemoryError {
        MemoryError::OutOfMemory {
            context: context.name().to_string(),
            size,
        }
    }

    fn alloc_large(&mut self, context: ContextInfo<'_>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let chunk_size = max_align(size);
        let mut block =
            Block::new(CHUNK_HEADER_SIZE + chunk_size).ok_or_else(|| Self::out_of_memory(context, size))?;
        let chunk = block
            .carve(CHUNK_HEADER_SIZE + chunk_size)
            .ok_or_else(|| Self::out_of_memory(context, size))?;

        self.large.push(block);
        Ok(unsafe { ChunkHeader::install(chunk, context.owner(), chunk_size) })
    }

    /// Split what is left of the active block into free-list chunks
    fn retire_active_block(&mut self, context: ContextInfo<'_>) {
        let Some(block) = self.blocks.last_mut() else {
            return;
        };

        while block.remaining() >= CHUNK_HEADER_SIZE + class_size(0) {
            let available = block.remaining() - CHUNK_HEADER_SIZE;
            let mut index = free_index(available.min(ALLOC_CHUNK_LIMIT));
            if class_size(index) > available {
                index -= 1;
            }

            let Some(chunk) = block.carve(CHUNK_HEADER_SIZE + class_size(index)) else {
                break;
            };
            let pointer = unsafe { ChunkHeader::install(chunk, context.owner(), class_size(index)) };
            self.freelist[index].push(pointer);
        }
    }

    fn take_large_block(&mut self, pointer: NonNull<u8>) -> Option<(usize, &mut Block)> {
        let start = unsafe { ChunkHeader::chunk_start(pointer) };
        self.large
            .iter_mut()
            .enumerate()
            .find(|(_, block)| block.start() == start)
    }

    #[cfg(debug_assertions)]
    unsafe fn clobber(pointer: NonNull<u8>, size: usize) {
        ptr::write_bytes(pointer.as_ptr(), CLOBBER_BYTE, size);
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    unsafe fn clobber(_pointer: NonNull<u8>, _size: usize) {}

    fn check_chunk(
        context: ContextInfo<'_>,
        pointer: *const u8,
        header: &ChunkHeader,
        problems: &mut Vec<ChunkProblem>,
        expect: impl FnOnce(usize) -> Option<String>,
    ) {
        let problem = |detail: String| ChunkProblem {
            context: context.name().to_string(),
            address: pointer as usize,
            detail,
        };

        if header.context() != context.owner() {
            problems.push(problem("bogus context link".to_string()));
        }
        if let Some(detail) = expect(header.size()) {
            problems.push(problem(detail));
        }
    }
}

impl MemoryContextMethods for AllocSet {
    fn kind(&self) -> &'static str {
        "AllocSet"
    }

    fn init(&mut self, _context: ContextInfo<'_>) {
        self.next_block_size = self.sizes.init_block_size;
        self.is_reset = true;
    }

    fn finish_create(&mut self, context: ContextInfo<'_>) -> Result<(), MemoryError> {
        if self.sizes.min_context_size == 0 {
            return Ok(());
        }

        let size = max_align(self.sizes.min_context_size);
        let keeper = Block::new(size).ok_or_else(|| Self::out_of_memory(context, size))?;
        self.blocks.push(keeper);
        self.has_keeper = true;

        Ok(())
    }

    fn alloc(&mut self, context: ContextInfo<'_>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        fatal_assert!(size <= MAX_ALLOC_SIZE, "invalid memory alloc request size {}", size);

        if size > ALLOC_CHUNK_LIMIT {
            let pointer = self.alloc_large(context, size)?;
            self.is_reset = false;
            return Ok(pointer);
        }

        let index = free_index(size);
        let chunk_size = class_size(index);

        if let Some(pointer) = self.freelist[index].pop() {
            self.is_reset = false;
            return Ok(pointer);
        }

        let needed = CHUNK_HEADER_SIZE + chunk_size;
        let fits = self.blocks.last().map_or(false, |block| block.remaining() >= needed);

        if !fits {
            self.retire_active_block(context);

            let mut block_size = self.next_block_size;
            self.next_block_size = (self.next_block_size * 2).min(self.sizes.max_block_size);
            while block_size < needed {
                block_size *= 2;
            }

            let block = Block::new(block_size).ok_or_else(|| Self::out_of_memory(context, size))?;
            self.blocks.push(block);
        }

        let chunk = self
            .blocks
            .last_mut()
            .and_then(|block| block.carve(needed))
            .ok_or_else(|| Self::out_of_memory(context, size))?;

        self.is_reset = false;
        Ok(unsafe { ChunkHeader::install(chunk, context.owner(), chunk_size) })
    }

    unsafe fn free(&mut self, context: ContextInfo<'_>, pointer: NonNull<u8>) {
        let size = (*ChunkHeader::from_pointer(pointer).as_ptr()).size();

        if size > ALLOC_CHUNK_LIMIT {
            let Some((index, _)) = self.take_large_block(pointer) else {
                fatal(format_args!(
                    "could not find block containing chunk {:p} in context \"{}\"",
                    pointer.as_ptr(),
                    context.name()
                ));
            };
            drop(self.large.swap_remove(index));
            return;
        }

        Self::clobber(pointer, size);
        self.freelist[free_index(size)].push(pointer);
    }

    unsafe fn realloc(
        &mut self,
        context: ContextInfo<'_>,
        pointer: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let old_size = (*ChunkHeader::from_pointer(pointer).as_ptr()).size();

        if old_size > ALLOC_CHUNK_LIMIT && size > ALLOC_CHUNK_LIMIT {
            let chunk_size = max_align(size);
            let Some((_, block)) = self.take_large_block(pointer) else {
                fatal(format_args!(
                    "could not find block containing chunk {:p} in context \"{}\"",
                    pointer.as_ptr(),
                    context.name()
                ));
            };

            if !block.grow(CHUNK_HEADER_SIZE + chunk_size) {
                return Err(Self::out_of_memory(context, size));
            }
            return Ok(ChunkHeader::install(block.start(), context.owner(), chunk_size));
        }

        if old_size <= ALLOC_CHUNK_LIMIT && size <= old_size {
            return Ok(pointer);
        }

        let moved = self.alloc(context, size)?;
        ptr::copy_nonoverlapping(pointer.as_ptr(), moved.as_ptr(), old_size.min(size));
        self.free(context, pointer);

        Ok(moved)
    }

    fn reset(&mut self, _context: ContextInfo<'_>) {
        if self.is_reset {
            return;
        }

        for list in &mut self.freelist {
            list.clear();
        }
        self.large.clear();

        if self.has_keeper {
            self.blocks.truncate(1);
            if let Some(keeper) = self.blocks.first_mut() {
                unsafe { Self::clobber(keeper.start(), keeper.used()) };
                keeper.reset();
            }
        } else {
            self.blocks.clear();
        }

        self.next_block_size = self.sizes.init_block_size;
        self.is_reset = true;
    }

    fn delete(&mut self, _context: ContextInfo<'_>) {
        for list in &mut self.freelist {
            list.clear();
        }
        self.large.clear();
        self.blocks.clear();
        self.has_keeper = false;
        self.is_reset = true;
    }

    unsafe fn get_chunk_space(&self, _context: ContextInfo<'_>, pointer: NonNull<u8>) -> usize {
        (*ChunkHeader::from_pointer(pointer).as_ptr()).size() + CHUNK_HEADER_SIZE
    }

    fn is_empty(&self, _context: ContextInfo<'_>) -> bool {
        self.is_reset
    }

    fn stats(&self, _context: ContextInfo<'_>, _level: usize) -> MemoryContextCounters {
        let mut counters = MemoryContextCounters::default();

        for block in self.blocks.iter().chain(self.large.iter()) {
            counters.nblocks += 1;
            counters.totalspace += block.size();
            counters.freespace += block.remaining();
        }

        for (index, list) in self.freelist.iter().enumerate() {
            counters.freechunks += list.len();
            counters.freespace += list.len() * (class_size(index) + CHUNK_HEADER_SIZE);
        }

        counters
    }

    fn check(&self, context: ContextInfo<'_>) -> Vec<ChunkProblem> {
        let mut problems = Vec::new();

        for block in &self.blocks {
            let mut offset = 0;
            while offset < block.used() {
                let chunk = unsafe { block.start().as_ptr().add(offset) };
                let header = unsafe { &*chunk.cast::<ChunkHeader>() };
                let pointer = unsafe { chunk.add(CHUNK_HEADER_SIZE) };
                let size = header.size();

                Self::check_chunk(context, pointer, header, &mut problems, |size| {
                    let legal = size <= ALLOC_CHUNK_LIMIT && size == class_size(free_index(size));
                    (!legal).then(|| format!("bogus chunk size {}", size))
                });

                if size > ALLOC_CHUNK_LIMIT || offset + CHUNK_HEADER_SIZE + size > block.used() {
                    problems.push(ChunkProblem {
                        context: context.name().to_string(),
                        address: pointer as usize,
                        detail: "chunk runs past the end of its block".to_string(),
                    });
                    break;
                }
                offset += CHUNK_HEADER_SIZE + size;
            }
        }

        for block in &self.large {
            let chunk = block.start().as_ptr();
            let header = unsafe { &*chunk.cast::<ChunkHeader>() };
            let pointer = unsafe { chunk.add(CHUNK_HEADER_SIZE) };
            let block_size = block.size();

            Self::check_chunk(context, pointer, header, &mut problems, |size| {
                (size <= ALLOC_CHUNK_LIMIT || size + CHUNK_HEADER_SIZE != block_size)
                    .then(|| format!("bad single-chunk size {} in block of {}", size, block_size))
            });
        }

        for (index, list) in self.freelist.iter().enumerate() {
            for &pointer in list {
                let header = unsafe { &*ChunkHeader::from_pointer(pointer).as_ptr() };
                let expected = class_size(index);

                Self::check_chunk(context, pointer.as_ptr(), header, &mut problems, |size| {
                    (size != expected).then(|| format!("free chunk of size {} on list for {}", size, expected))
                });

                if !self.blocks.iter().any(|block| block.contains(pointer.as_ptr())) {
                    problems.push(ChunkProblem {
                        context: context.name().to_string(),
                        address: pointer.as_ptr() as usize,
                        detail: "free chunk outside every block".to_string(),
                    });
                }
            }
        }

        problems
    }
}
