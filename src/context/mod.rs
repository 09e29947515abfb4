//! Context tree manager - nested allocation contexts
//!
//! Design: A tree of context nodes, each owning its chunks and its children.
//! Memory is reclaimed in bulk per scope by resetting or deleting a node.
//!
//! ```text
//!   TopMemoryContext (shared, never deleted)
//!   ├── ErrorContext (shared, 8 KiB reserve)
//!   ├── RequestContext          ← most recent child first
//!   │   └── ScratchContext
//!   └── SubsystemContext
//! ```
//!
//! Ownership: the parent owns its children through strong handles, roots
//! are owned by a process-wide registry, and each child keeps only a weak
//! back-reference. A `MemoryContext` handle held by a caller keeps the node
//! storage alive but not the node's membership in the tree; operations on a
//! deleted node are fatal.
//!
//! Lifecycle: `Uninitialized → Linked → Active → Deleted`.

mod current;
mod lock;

#[cfg(test)]
mod tests;

pub use current::{
    current_memory_context, default_alloc_set_sizes, ensure_initialized, error_context, init,
    init_with_config, is_initialized, top_most_memory_context, CurrentContextGuard,
};
pub(crate) use current::stage_in_error_context;

use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{fatal_assert, MemoryError};
use crate::header::{self, alloc_size_is_valid};
use crate::logging::{
    log_allocation, log_context_created, log_context_deleted, log_context_reset, log_deallocation,
    log_invalid_alloc_size,
};
#[cfg(any(debug_assertions, feature = "context-checking"))]
use crate::logging::{log_chunk_problem, log_context_stats, perf};
use crate::methods::{ChunkProblem, ContextInfo, MemoryContextCounters, MemoryContextMethods};
use lock::{ParentLock, SharedLock};

/// Contexts created without a parent, owned until explicitly deleted
static ROOT_CONTEXTS: Lazy<Mutex<Vec<MemoryContext>>> = Lazy::new(|| Mutex::new(Vec::new()));

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized = 0,
    Linked = 1,
    Active = 2,
    Deleted = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Linked,
            2 => Self::Active,
            _ => Self::Deleted,
        }
    }
}

struct TreeLinks {
    parent: Option<Weak<ContextNode>>,
    /// Most recently created child first
    children: VecDeque<MemoryContext>,
}

/// One node of the context tree.
///
/// Opaque outside the crate; strategies see it only through `ContextInfo`
/// and as the target of `ChunkHeader` back-references.
pub struct ContextNode {
    name: Box<str>,
    kind: &'static str,
    footprint: usize,
    lock: Option<SharedLock>,
    lifecycle: AtomicU8,
    links: UnsafeCell<TreeLinks>,
    methods: UnsafeCell<Box<dyn MemoryContextMethods>>,
}

// Safety: `links` and `methods` of a shared node are only touched while its
// `SharedLock` is held. A private node is confined to the thread that owns
// the current-context reference pointing at or above it; that confinement is
// a calling convention of the subsystem and is not checked.
unsafe impl Send for ContextNode {}
unsafe impl Sync for ContextNode {}

impl ContextNode {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.lock.is_some()
    }

    #[inline]
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    #[inline]
    fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn is_valid(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Linked | Lifecycle::Active)
    }

    fn assert_valid(&self) {
        fatal_assert!(
            self.is_valid(),
            "invalid memory context \"{}\" (state {:?})",
            self.name,
            self.lifecycle()
        );
    }

    /// Run `f` on the tree links.
    ///
    /// # Safety
    /// The caller holds this node's lock if it is shared (or owns the node's
    /// thread if private), and `f` must not reach this node's links again.
    #[inline]
    unsafe fn with_links<R>(&self, f: impl FnOnce(&mut TreeLinks) -> R) -> R {
        f(&mut *self.links.get())
    }

    /// Dispatch to the strategy.
    ///
    /// # Safety
    /// Same locking requirement as `with_links`; strategies cannot re-enter
    /// because they only receive a `ContextInfo`.
    #[inline]
    unsafe fn with_methods<R>(
        &self,
        f: impl FnOnce(&mut dyn MemoryContextMethods, ContextInfo<'_>) -> R,
    ) -> R {
        let methods: &mut dyn MemoryContextMethods = &mut **self.methods.get();
        f(methods, ContextInfo::new(self))
    }
}

/// Handle to a context node.
///
/// Cloning is cheap and does not create a new context.
#[derive(Clone)]
pub struct MemoryContext(Arc<ContextNode>);

impl MemoryContext {
    // ===== Creation =====

    /// Context-type-independent part of context creation.
    ///
    /// Intended for concrete strategy constructors such as `AllocSet::create`.
    /// The strategy is initialized before the node becomes reachable; only
    /// then is it linked under `parent` (under the parent's lock when shared).
    /// The strategy's `finish_create` runs last; if it fails the node is
    /// deleted again so no half-built context stays in the tree.
    pub fn create(
        methods: Box<dyn MemoryContextMethods>,
        parent: Option<&MemoryContext>,
        name: &str,
        shared: bool,
    ) -> Result<MemoryContext, MemoryError> {
        if let Some(parent) = parent {
            parent.0.assert_valid();
        }

        let footprint = mem::size_of::<ContextNode>() + mem::size_of_val(&*methods) + name.len() + 1;
        let kind = methods.kind();

        let node = Arc::new(ContextNode {
            name: name.into(),
            kind,
            footprint,
            lock: shared.then(SharedLock::new),
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            links: UnsafeCell::new(TreeLinks {
                parent: None,
                children: VecDeque::new(),
            }),
            methods: UnsafeCell::new(methods),
        });
        let context = MemoryContext(node);

        // Not yet reachable from any other thread: no lock needed
        unsafe {
            context.0.with_methods(|methods, info| methods.init(info));
        }

        match parent {
            Some(parent) => {
                let _guard = parent.0.lock();
                unsafe {
                    context
                        .0
                        .with_links(|links| links.parent = Some(Arc::downgrade(&parent.0)));
                }
                context.0.set_lifecycle(Lifecycle::Linked);
                unsafe {
                    parent
                        .0
                        .with_links(|links| links.children.push_front(context.clone()));
                }
            }
            None => {
                context.0.set_lifecycle(Lifecycle::Linked);
                ROOT_CONTEXTS.lock().push(context.clone());
            }
        }

        let finished = {
            let _guard = context.0.lock();
            unsafe { context.0.with_methods(|methods, info| methods.finish_create(info)) }
        };

        if let Err(err) = finished {
            context.delete_internal(ParentLock::Acquire);
            return Err(err);
        }

        context.0.set_lifecycle(Lifecycle::Active);
        log_context_created(name, kind, parent.map(MemoryContext::name), shared);

        Ok(context)
    }

    /// Rebuild a handle from a chunk header back-reference.
    ///
    /// # Safety
    /// `node` must come from a live chunk header, so the node is still owned
    /// by the tree or by some handle.
    pub(crate) unsafe fn from_node_ptr(node: NonNull<ContextNode>) -> MemoryContext {
        let raw = node.as_ptr() as *const ContextNode;
        Arc::increment_strong_count(raw);
        let context = MemoryContext(Arc::from_raw(raw));
        context.0.assert_valid();
        context
    }

    // ===== Introspection =====

    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Name of the strategy behind this context
    #[inline]
    pub fn kind(&self) -> &'static str {
        self.0.kind()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.0.is_shared()
    }

    /// Bytes of node bookkeeping fixed at creation (node, strategy, name)
    #[inline]
    pub fn footprint(&self) -> usize {
        self.0.footprint
    }

    /// True once the context has been deleted
    pub fn is_deleted(&self) -> bool {
        self.0.lifecycle() == Lifecycle::Deleted
    }

    #[inline]
    pub fn ptr_eq(&self, other: &MemoryContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub(crate) fn node_ptr(&self) -> NonNull<ContextNode> {
        NonNull::from(&*self.0)
    }

    pub fn parent(&self) -> Option<MemoryContext> {
        self.0.assert_valid();
        let _guard = self.0.lock();
        unsafe {
            self.0
                .with_links(|links| links.parent.as_ref().and_then(Weak::upgrade))
                .map(MemoryContext)
        }
    }

    /// Snapshot of the children, most recently created first
    pub fn children(&self) -> Vec<MemoryContext> {
        self.0.assert_valid();
        let _guard = self.0.lock();
        unsafe { self.snapshot_children() }
    }

    pub fn first_child(&self) -> Option<MemoryContext> {
        self.0.assert_valid();
        let _guard = self.0.lock();
        unsafe { self.0.with_links(|links| links.children.front().cloned()) }
    }

    /// # Safety
    /// Caller holds this node's lock when shared.
    unsafe fn snapshot_children(&self) -> Vec<MemoryContext> {
        self.0.with_links(|links| links.children.iter().cloned().collect())
    }

    // ===== Allocation =====

    /// Allocate `size` bytes in this context
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        self.0.assert_valid();

        if !alloc_size_is_valid(size) {
            log_invalid_alloc_size(self.name(), size);
            return Err(MemoryError::InvalidAllocSize { size });
        }

        let pointer = {
            let _guard = self.0.lock();
            unsafe { self.0.with_methods(|methods, info| methods.alloc(info, size))? }
        };

        log_allocation(self.name(), size, pointer.as_ptr());
        Ok(pointer)
    }

    /// Allocate `size` bytes and clear them
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let pointer = self.alloc(size)?;
        unsafe {
            ptr::write_bytes(pointer.as_ptr(), 0, size);
        }
        Ok(pointer)
    }

    /// Copy `text` into this context, followed by a NUL terminator
    pub fn strdup(&self, text: &str) -> Result<NonNull<u8>, MemoryError> {
        self.strndup(text.as_bytes())
    }

    /// Copy `bytes` into this context and append a NUL terminator
    pub fn strndup(&self, bytes: &[u8]) -> Result<NonNull<u8>, MemoryError> {
        let len = bytes.len();
        let size = len.checked_add(1).ok_or(MemoryError::InvalidAllocSize { size: len })?;
        let pointer = self.alloc(size)?;

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), pointer.as_ptr(), len);
            pointer.as_ptr().add(len).write(0);
        }

        Ok(pointer)
    }

    /// Release a chunk owned by this context.
    ///
    /// # Safety
    /// `pointer` must be a live chunk of this context.
    pub(crate) unsafe fn free_chunk(&self, pointer: NonNull<u8>) {
        self.0.assert_valid();
        {
            let _guard = self.0.lock();
            self.0.with_methods(|methods, info| methods.free(info, pointer));
        }
        log_deallocation(self.name(), pointer.as_ptr());
    }

    /// Resize a chunk owned by this context.
    ///
    /// # Safety
    /// `pointer` must be a live chunk of this context.
    pub(crate) unsafe fn realloc_chunk(
        &self,
        pointer: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        self.0.assert_valid();

        if !alloc_size_is_valid(size) {
            log_invalid_alloc_size(self.name(), size);
            return Err(MemoryError::InvalidAllocSize { size });
        }

        let _guard = self.0.lock();
        self.0
            .with_methods(|methods, info| methods.realloc(info, pointer, size))
    }

    /// # Safety
    /// `pointer` must be a live chunk of this context.
    pub(crate) unsafe fn chunk_space(&self, pointer: NonNull<u8>) -> usize {
        self.0.assert_valid();
        let _guard = self.0.lock();
        self.0
            .with_methods(|methods, info| methods.get_chunk_space(info, pointer))
    }

    /// Whether `pointer` looks like a chunk of this context.
    ///
    /// Null or misaligned pointers yield `false`. A foreign pointer can
    /// produce a false positive, so never base a security decision on this.
    ///
    /// # Safety
    /// For a non-null aligned `pointer`, the header-sized span in front of it
    /// must be readable.
    pub unsafe fn contains(&self, pointer: *const u8) -> bool {
        header::header_matches(self.node_ptr(), pointer)
    }

    // ===== Reset / delete =====

    /// Release all chunks of this context and its descendants, keeping
    /// every node in place
    pub fn reset(&self) {
        self.0.assert_valid();

        let _guard = self.0.lock();
        unsafe {
            self.reset_children_locked();
            self.0.with_methods(|methods, info| methods.reset(info));
        }

        log_context_reset(self.name(), false);
    }

    /// Release all chunks of the descendants; this context's own chunks stay
    pub fn reset_children(&self) {
        self.0.assert_valid();

        let _guard = self.0.lock();
        unsafe {
            self.reset_children_locked();
        }

        log_context_reset(self.name(), true);
    }

    /// # Safety
    /// Caller holds this node's lock when shared.
    unsafe fn reset_children_locked(&self) {
        for child in self.snapshot_children() {
            child.reset();
        }
    }

    /// Delete this context and its whole subtree.
    ///
    /// Fatal if the subtree contains the top-most context or this thread's
    /// current context; in that case nothing is modified.
    pub fn delete(self) {
        self.0.assert_valid();
        self.assert_subtree_deletable();
        self.delete_internal(ParentLock::Acquire);
    }

    /// Delete every descendant; this context itself stays
    pub fn delete_children(&self) {
        self.0.assert_valid();
        {
            let _guard = self.0.lock();
            for child in unsafe { self.snapshot_children() } {
                child.assert_subtree_deletable();
            }
        }
        self.delete_children_internal();
    }

    /// Delete every descendant, then release this context's own chunks
    pub fn reset_and_delete_children(&self) {
        self.delete_children();

        let _guard = self.0.lock();
        unsafe {
            self.0.with_methods(|methods, info| methods.reset(info));
        }

        log_context_reset(self.name(), false);
    }

    fn assert_subtree_deletable(&self) {
        fatal_assert!(
            !current::is_top_most(self),
            "cannot delete the top-most memory context"
        );
        fatal_assert!(
            !current::is_current(self),
            "cannot delete the current memory context \"{}\"",
            self.name()
        );

        // Children stay linked while the parent's lock is held
        let _guard = self.0.lock();
        for child in unsafe { self.snapshot_children() } {
            child.assert_subtree_deletable();
        }
    }

    fn delete_internal(&self, parent_lock: ParentLock) {
        self.0.assert_valid();
        fatal_assert!(
            !current::is_top_most(self),
            "cannot delete the top-most memory context"
        );
        fatal_assert!(
            !current::is_current(self),
            "cannot delete the current memory context \"{}\"",
            self.name()
        );

        self.delete_children_internal();

        // Delink before releasing storage: a failure past this point leaks
        // the node instead of leaving a broken node in the tree
        let parent = {
            let _guard = self.0.lock();
            unsafe { self.0.with_links(|links| links.parent.take()) }
        };

        let detached = match parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) => {
                let _guard = parent.lock_unless_held(parent_lock);
                unsafe {
                    parent.with_links(|links| {
                        let position = links.children.iter().position(|child| child.ptr_eq(self));
                        position.and_then(|index| links.children.remove(index))
                    })
                }
            }
            None => {
                let mut roots = ROOT_CONTEXTS.lock();
                let position = roots.iter().position(|root| root.ptr_eq(self));
                position.map(|index| roots.swap_remove(index))
            }
        };

        {
            let _guard = self.0.lock();
            unsafe {
                self.0.with_methods(|methods, info| methods.delete(info));
            }
        }

        self.0.set_lifecycle(Lifecycle::Deleted);
        log_context_deleted(self.name());

        // The tree's strong reference goes last
        drop(detached);
    }

    fn delete_children_internal(&self) {
        let _guard = self.0.lock();

        // Each delete delinks the child, so keep taking the first one.
        // We hold the lock, so children must not take it again.
        while let Some(child) = unsafe { self.0.with_links(|links| links.children.front().cloned()) } {
            child.delete_internal(ParentLock::AlreadyHeld);
        }
    }

    /// A context with living children is never empty; otherwise the
    /// strategy decides
    pub fn is_empty(&self) -> bool {
        self.0.assert_valid();

        let _guard = self.0.lock();
        let has_children = unsafe { self.0.with_links(|links| !links.children.is_empty()) };
        if has_children {
            return false;
        }

        unsafe { self.0.with_methods(|methods, info| methods.is_empty(info)) }
    }

    // ===== Current context =====

    /// Install this context as the thread's current context and return the
    /// previous one; the caller restores it
    pub fn switch_to(&self) -> MemoryContext {
        current::switch_to(self)
    }

    /// Install this context as current until the guard is dropped
    pub fn enter(&self) -> CurrentContextGuard {
        CurrentContextGuard::new(self)
    }

    // ===== Diagnostics =====

    /// Report space usage of this context and every descendant
    #[cfg(any(debug_assertions, feature = "context-checking"))]
    pub fn stats(&self) -> StatsReport {
        let _perf = perf::track("context_stats");
        let mut report = StatsReport::default();
        self.stats_internal(0, &mut report);
        report
    }

    #[cfg(any(debug_assertions, feature = "context-checking"))]
    fn stats_internal(&self, level: usize, report: &mut StatsReport) {
        self.0.assert_valid();

        // Held while descending so no child can be delinked mid-traversal
        let _guard = self.0.lock();
        let (counters, children) = unsafe {
            (
                self.0.with_methods(|methods, info| methods.stats(info, level)),
                self.snapshot_children(),
            )
        };

        log_context_stats(level, self.name(), &counters);
        report.entries.push(StatsEntry {
            level,
            name: self.name().to_string(),
            counters,
        });

        for child in children {
            child.stats_internal(level + 1, report);
        }
    }

    /// Validate every chunk of this context and its descendants
    #[cfg(any(debug_assertions, feature = "context-checking"))]
    pub fn check(&self) -> Vec<ChunkProblem> {
        let _perf = perf::track("context_check");
        let mut problems = Vec::new();
        self.check_internal(&mut problems);
        problems
    }

    #[cfg(any(debug_assertions, feature = "context-checking"))]
    fn check_internal(&self, problems: &mut Vec<ChunkProblem>) {
        self.0.assert_valid();

        let _guard = self.0.lock();
        let (found, children) = unsafe {
            (
                self.0.with_methods(|methods, info| methods.check(info)),
                self.snapshot_children(),
            )
        };

        for problem in &found {
            log_chunk_problem(problem);
        }
        problems.extend(found);

        for child in children {
            child.check_internal(problems);
        }
    }

    /// Copy `message` into this context and release it again without ever
    /// blocking. Returns false if the context was busy or out of memory.
    pub(crate) fn try_stage(&self, message: &str) -> bool {
        if !self.0.is_valid() {
            return false;
        }

        let Some(_guard) = self.0.try_lock() else {
            return false;
        };

        unsafe {
            self.0.with_methods(|methods, info| {
                let Ok(pointer) = methods.alloc(info, message.len() + 1) else {
                    return false;
                };
                ptr::copy_nonoverlapping(message.as_ptr(), pointer.as_ptr(), message.len());
                pointer.as_ptr().add(message.len()).write(0);
                methods.free(info, pointer);
                true
            })
        }
    }
}

impl PartialEq for MemoryContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for MemoryContext {}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContext")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("shared", &self.is_shared())
            .field("state", &self.0.lifecycle())
            .finish()
    }
}

/// One line of a stats report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsEntry {
    pub level: usize,
    pub name: String,
    pub counters: MemoryContextCounters,
}

/// Space usage of a context subtree, parents before their children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub entries: Vec<StatsEntry>,
}

impl StatsReport {
    pub fn grand_total(&self) -> MemoryContextCounters {
        let mut total = MemoryContextCounters::default();
        for entry in &self.entries {
            total.accumulate(&entry.counters);
        }
        total
    }

    pub fn find(&self, name: &str) -> Option<&StatsEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{:indent$}{}: {}", "", entry.name, entry.counters, indent = entry.level * 2)?;
        }
        write!(f, "Grand total: {}", self.grand_total())
    }
}
