//! Context strategy interface - the pluggable allocation method set
//!
//! Design: Every context kind implements `MemoryContextMethods`; the tree
//! manager dispatches through the node's boxed strategy and never names a
//! concrete kind. Several kinds can coexist in one tree.
//!
//! Strategies only ever see a `ContextInfo`, which exposes the node's
//! identity and name but none of the tree operations, so a strategy cannot
//! re-enter its own context while the framework is dispatching to it.

use core::fmt;
use core::ptr::NonNull;

use crate::context::ContextNode;
use crate::error::MemoryError;

/// Read-only view of the node a strategy is operating on
#[derive(Clone, Copy)]
pub struct ContextInfo<'a> {
    node: &'a ContextNode,
}

impl<'a> ContextInfo<'a> {
    #[inline]
    pub(crate) fn new(node: &'a ContextNode) -> Self {
        Self { node }
    }

    /// Diagnostic name of the context
    #[inline]
    pub fn name(&self) -> &'a str {
        self.node.name()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.node.is_shared()
    }

    /// Back-reference to stamp into chunk headers
    #[inline]
    pub fn owner(&self) -> NonNull<ContextNode> {
        NonNull::from(self.node)
    }
}

impl fmt::Debug for ContextInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInfo")
            .field("name", &self.name())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Space accounting reported by a strategy for one context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryContextCounters {
    pub nblocks: usize,
    pub freechunks: usize,
    pub totalspace: usize,
    pub freespace: usize,
}

impl MemoryContextCounters {
    #[inline]
    pub fn used(&self) -> usize {
        self.totalspace.saturating_sub(self.freespace)
    }

    pub fn accumulate(&mut self, other: &Self) {
        self.nblocks += other.nblocks;
        self.freechunks += other.freechunks;
        self.totalspace += other.totalspace;
        self.freespace += other.freespace;
    }
}

impl fmt::Display for MemoryContextCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total in {} blocks; {} free ({} chunks); {} used",
            self.totalspace,
            self.nblocks,
            self.freespace,
            self.freechunks,
            self.used()
        )
    }
}

/// A consistency violation found by `check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProblem {
    pub context: String,
    pub address: usize,
    pub detail: String,
}

impl fmt::Display for ChunkProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "problem in context {}: {} (chunk {:#x})", self.context, self.detail, self.address)
    }
}

/// Operations every concrete context kind must provide.
///
/// Callers never invoke these directly; they go through `MemoryContext` and
/// the pointer-taking functions in `palloc`, which validate arguments and take
/// the node's lock when the context is shared.
pub trait MemoryContextMethods: Send {
    /// Short name of the context kind, used in diagnostics
    fn kind(&self) -> &'static str;

    /// Make the strategy minimally valid. Must not allocate or fail.
    fn init(&mut self, context: ContextInfo<'_>);

    /// Finish type-specific setup after the node is linked. May fail; the
    /// strategy must stay in a state `delete` can handle.
    fn finish_create(&mut self, _context: ContextInfo<'_>) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Allocate `size` bytes. The returned pointer must be preceded by a
    /// `ChunkHeader` naming `context`.
    fn alloc(&mut self, context: ContextInfo<'_>, size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Release a chunk to the context's free pool.
    ///
    /// # Safety
    /// `pointer` must be a live chunk owned by this context.
    unsafe fn free(&mut self, context: ContextInfo<'_>, pointer: NonNull<u8>);

    /// Resize a chunk, possibly moving it.
    ///
    /// # Safety
    /// `pointer` must be a live chunk owned by this context.
    unsafe fn realloc(
        &mut self,
        context: ContextInfo<'_>,
        pointer: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError>;

    /// Release every chunk owned directly by this context.
    fn reset(&mut self, context: ContextInfo<'_>);

    /// Release all internal storage ahead of the node being destroyed.
    fn delete(&mut self, context: ContextInfo<'_>);

    /// Space occupied by the chunk, including header and padding.
    ///
    /// # Safety
    /// `pointer` must be a live chunk owned by this context.
    unsafe fn get_chunk_space(&self, context: ContextInfo<'_>, pointer: NonNull<u8>) -> usize;

    /// True if nothing is allocated in this context.
    fn is_empty(&self, context: ContextInfo<'_>) -> bool;

    /// Space accounting for this context alone.
    fn stats(&self, context: ContextInfo<'_>, level: usize) -> MemoryContextCounters;

    /// Validate every live chunk's internal consistency.
    fn check(&self, context: ContextInfo<'_>) -> Vec<ChunkProblem>;
}
