//! memctx - nested memory contexts for a transaction-coordination server
//!
//! A tree of allocation contexts that lets the server bound and reclaim
//! memory in bulk per logical scope (a request, a subsystem, the process
//! lifetime) instead of tracking individual allocations.
//!
//! ```no_run
//! use memctx::{AllocSet, palloc, pfree};
//!
//! memctx::ensure_initialized();
//! let top = memctx::top_most_memory_context();
//! let request = AllocSet::create_default(&top, "RequestContext").unwrap();
//!
//! {
//!     let _scope = request.enter();
//!     let buffer = palloc(256).unwrap();
//!     unsafe { pfree(buffer) };
//! }
//!
//! request.delete();
//! ```

pub mod aset;
pub mod config;
pub mod context;
pub mod error;
pub mod header;
pub mod logging;
pub mod methods;
pub mod palloc;

pub use aset::{AllocSet, AllocSetSizes};
pub use config::MemoryConfig;
pub use context::{
    current_memory_context, ensure_initialized, error_context, init, init_with_config,
    is_initialized, top_most_memory_context, CurrentContextGuard, MemoryContext, StatsEntry,
    StatsReport,
};
pub use error::{ConfigError, MemoryError};
pub use header::{
    get_memory_chunk_context, get_memory_chunk_space, ChunkHeader, CHUNK_HEADER_SIZE,
    MAXIMUM_ALIGNOF, MAX_ALLOC_SIZE,
};
pub use methods::{ChunkProblem, ContextInfo, MemoryContextCounters, MemoryContextMethods};
pub use palloc::{alloc_top, palloc, palloc0, pfree, pnstrdup, pstrdup, repalloc, GenAlloc, GEN_ALLOC};
