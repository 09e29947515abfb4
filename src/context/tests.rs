//! Context tree unit tests

use super::*;
use crate::aset::{AllocSet, AllocSetSizes};
use crate::header::{
    get_memory_chunk_context, get_memory_chunk_space, max_align, ChunkHeader, CHUNK_HEADER_SIZE,
    MAXIMUM_ALIGNOF, MAX_ALLOC_SIZE,
};
use crate::palloc::{pfree, repalloc};
use std::alloc::Layout;
use std::panic::{self, AssertUnwindSafe};

// ===== Test strategy =====

/// One global-allocator allocation per chunk, with a shared event log
struct TrackingStrategy {
    live: Vec<(NonNull<u8>, Layout)>,
    fail_finish: bool,
    events: Arc<Mutex<Vec<&'static str>>>,
}

// Safety: chunk pointers are owned by the strategy alone
unsafe impl Send for TrackingStrategy {}

impl TrackingStrategy {
    fn new(events: &Arc<Mutex<Vec<&'static str>>>) -> Box<Self> {
        Box::new(Self {
            live: Vec::new(),
            fail_finish: false,
            events: Arc::clone(events),
        })
    }

    fn failing(events: &Arc<Mutex<Vec<&'static str>>>) -> Box<Self> {
        let mut strategy = Self::new(events);
        strategy.fail_finish = true;
        strategy
    }

    fn release_all(&mut self) {
        for (chunk, layout) in self.live.drain(..) {
            unsafe { std::alloc::dealloc(chunk.as_ptr(), layout) };
        }
    }
}

impl MemoryContextMethods for TrackingStrategy {
    fn kind(&self) -> &'static str {
        "Tracking"
    }

    fn init(&mut self, _context: ContextInfo<'_>) {
        self.events.lock().push("init");
    }

    fn finish_create(&mut self, context: ContextInfo<'_>) -> Result<(), MemoryError> {
        self.events.lock().push("finish_create");
        if self.fail_finish {
            return Err(MemoryError::OutOfMemory {
                context: context.name().to_string(),
                size: 0,
            });
        }
        Ok(())
    }

    fn alloc(&mut self, context: ContextInfo<'_>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let chunk_size = max_align(size.max(1));
        let layout = Layout::from_size_align(CHUNK_HEADER_SIZE + chunk_size, MAXIMUM_ALIGNOF)
            .map_err(|_| MemoryError::InvalidAllocSize { size })?;
        let chunk = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(MemoryError::OutOfMemory {
            context: context.name().to_string(),
            size,
        })?;

        self.live.push((chunk, layout));
        Ok(unsafe { ChunkHeader::install(chunk, context.owner(), chunk_size) })
    }

    unsafe fn free(&mut self, _context: ContextInfo<'_>, pointer: NonNull<u8>) {
        let start = ChunkHeader::chunk_start(pointer);
        if let Some(index) = self.live.iter().position(|(chunk, _)| *chunk == start) {
            let (chunk, layout) = self.live.swap_remove(index);
            std::alloc::dealloc(chunk.as_ptr(), layout);
        }
    }

    unsafe fn realloc(
        &mut self,
        context: ContextInfo<'_>,
        pointer: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let old_size = (*ChunkHeader::from_pointer(pointer).as_ptr()).size();
        let moved = self.alloc(context, size)?;
        ptr::copy_nonoverlapping(pointer.as_ptr(), moved.as_ptr(), old_size.min(size));
        self.free(context, pointer);
        Ok(moved)
    }

    fn reset(&mut self, _context: ContextInfo<'_>) {
        self.events.lock().push("reset");
        self.release_all();
    }

    fn delete(&mut self, _context: ContextInfo<'_>) {
        self.events.lock().push("delete");
        self.release_all();
    }

    unsafe fn get_chunk_space(&self, _context: ContextInfo<'_>, pointer: NonNull<u8>) -> usize {
        (*ChunkHeader::from_pointer(pointer).as_ptr()).size() + CHUNK_HEADER_SIZE
    }

    fn is_empty(&self, _context: ContextInfo<'_>) -> bool {
        self.live.is_empty()
    }

    fn stats(&self, _context: ContextInfo<'_>, _level: usize) -> MemoryContextCounters {
        MemoryContextCounters {
            nblocks: self.live.len(),
            freechunks: 0,
            totalspace: self.live.iter().map(|(_, layout)| layout.size()).sum(),
            freespace: 0,
        }
    }

    fn check(&self, _context: ContextInfo<'_>) -> Vec<ChunkProblem> {
        Vec::new()
    }
}

impl Drop for TrackingStrategy {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn top() -> MemoryContext {
    ensure_initialized();
    top_most_memory_context()
}

fn child_of(parent: &MemoryContext, name: &str) -> MemoryContext {
    AllocSet::create(Some(parent), name, AllocSetSizes::SMALL, false).unwrap()
}

fn child_names(context: &MemoryContext) -> Vec<String> {
    context.children().iter().map(|child| child.name().to_string()).collect()
}

// ===== Creation and linking =====

#[test]
fn test_children_are_prepended() {
    let parent = child_of(&top(), "link-parent");
    let first = child_of(&parent, "first");
    let second = child_of(&parent, "second");

    assert_eq!(child_names(&parent), ["second", "first"]);
    assert_eq!(parent.first_child(), Some(second.clone()));
    assert_eq!(first.parent(), Some(parent.clone()));
    assert_eq!(parent.parent(), Some(top()));
    assert_eq!(first.kind(), "AllocSet");
    assert!(!first.is_shared());
    assert!(first.footprint() >= "first".len());

    parent.delete();
}

#[test]
fn test_root_context_lives_until_deleted() {
    let root = AllocSet::create(None, "detached-root", AllocSetSizes::SMALL, false).unwrap();
    assert!(root.parent().is_none());

    let pointer = root.alloc(64).unwrap();
    unsafe { assert_eq!(get_memory_chunk_context(pointer), root) };

    assert!(ROOT_CONTEXTS.lock().iter().any(|context| context.ptr_eq(&root)));
    root.clone().delete();
    assert!(!ROOT_CONTEXTS.lock().iter().any(|context| context.ptr_eq(&root)));
    assert!(root.is_deleted());
}

#[test]
fn test_strategy_init_runs_before_finish_create() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let parent = child_of(&top(), "events-parent");

    let tracked = MemoryContext::create(TrackingStrategy::new(&events), Some(&parent), "tracked", false).unwrap();
    assert_eq!(*events.lock(), ["init", "finish_create"]);

    parent.delete();
    assert_eq!(*events.lock(), ["init", "finish_create", "delete"]);
    assert!(tracked.is_deleted());
}

#[test]
fn test_failed_finish_create_leaves_no_node() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let parent = child_of(&top(), "failing-parent");

    let result = MemoryContext::create(TrackingStrategy::failing(&events), Some(&parent), "broken", false);
    assert!(matches!(result, Err(MemoryError::OutOfMemory { .. })));
    assert!(parent.children().is_empty());
    assert_eq!(*events.lock(), ["init", "finish_create", "delete"]);

    parent.delete();
}

#[test]
fn test_kinds_coexist_in_one_tree() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let parent = child_of(&top(), "mixed-parent");
    let tracked = MemoryContext::create(TrackingStrategy::new(&events), Some(&parent), "tracked", false).unwrap();

    let from_set = parent.alloc(100).unwrap();
    let from_tracked = tracked.alloc(100).unwrap();

    unsafe {
        assert_eq!(get_memory_chunk_context(from_set), parent);
        assert_eq!(get_memory_chunk_context(from_tracked), tracked);
        assert_eq!(get_memory_chunk_space(from_tracked), 104 + CHUNK_HEADER_SIZE);

        let moved = repalloc(from_tracked, 300).unwrap();
        assert_eq!(get_memory_chunk_context(moved), tracked);
        pfree(moved);
        pfree(from_set);
    }

    assert!(tracked.is_empty());
    parent.delete();
}

// ===== Allocation =====

#[test]
fn test_invalid_alloc_size_is_reported() {
    let context = child_of(&top(), "invalid-size");

    let err = context.alloc(MAX_ALLOC_SIZE + 1).unwrap_err();
    assert_eq!(err, MemoryError::InvalidAllocSize { size: MAX_ALLOC_SIZE + 1 });
    assert!(context.is_empty());

    context.delete();
}

#[test]
fn test_strdup_appends_terminator() {
    let context = child_of(&top(), "strdup");

    let pointer = context.strdup("transaction 42").unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(pointer.as_ptr(), 15) };
    assert_eq!(bytes, b"transaction 42\0");

    context.delete();
}

#[test]
fn test_contains() {
    let first = child_of(&top(), "contains-a");
    let second = child_of(&top(), "contains-b");
    let pointer = first.alloc(40).unwrap();

    unsafe {
        assert!(first.contains(pointer.as_ptr()));
        assert!(!second.contains(pointer.as_ptr()));
        assert!(!first.contains(ptr::null()));
        assert!(!first.contains(pointer.as_ptr().add(3)));
    }

    first.delete();
    second.delete();
}

// ===== Reset =====

#[test]
fn test_reset_keeps_children() {
    let parent = child_of(&top(), "reset-parent");
    let child = child_of(&parent, "reset-child");

    parent.alloc(128).unwrap();
    child.alloc(128).unwrap();

    parent.reset();

    assert_eq!(parent.children(), vec![child.clone()]);
    assert!(child.is_empty());
    // A parent with a living child is never empty
    assert!(!parent.is_empty());

    assert!(parent.alloc(128).is_ok());
    parent.delete();
}

#[test]
fn test_reset_children_spares_own_chunks() {
    let parent = child_of(&top(), "reset-children-parent");
    let child = child_of(&parent, "reset-children-child");

    let own = parent.strdup("survives").unwrap();
    child.alloc(64).unwrap();

    parent.reset_children();

    assert!(child.is_empty());
    let bytes = unsafe { std::slice::from_raw_parts(own.as_ptr(), 9) };
    assert_eq!(bytes, b"survives\0");

    parent.delete();
}

#[cfg(any(debug_assertions, feature = "context-checking"))]
#[test]
fn test_reset_children_is_idempotent() {
    let parent = child_of(&top(), "idempotent-parent");
    let child = child_of(&parent, "idempotent-child");
    child_of(&child, "idempotent-grandchild").alloc(2000).unwrap();
    child.alloc(300).unwrap();

    parent.reset_children();
    let once = parent.stats();
    parent.reset_children();
    let twice = parent.stats();

    assert_eq!(once, twice);
    assert_eq!(child_names(&parent), ["idempotent-child"]);
    parent.delete();
}

// ===== Delete =====

#[test]
fn test_delete_removes_subtree() {
    let parent = child_of(&top(), "delete-parent");
    let doomed = child_of(&parent, "doomed");
    let grandchild = child_of(&doomed, "doomed-grandchild");
    let sibling = child_of(&parent, "sibling");

    doomed.clone().delete();

    assert_eq!(parent.children(), vec![sibling]);
    assert!(doomed.is_deleted());
    assert!(grandchild.is_deleted());

    parent.delete();
}

#[test]
fn test_delete_children_keeps_node() {
    let parent = child_of(&top(), "delete-children-parent");
    let first = child_of(&parent, "a");
    let second = child_of(&parent, "b");
    let own = parent.alloc(32).unwrap();

    parent.delete_children();

    assert!(parent.children().is_empty());
    assert!(first.is_deleted() && second.is_deleted());
    unsafe { assert!(parent.contains(own.as_ptr())) };
    assert!(!parent.is_empty());

    parent.delete();
}

#[test]
fn test_reset_and_delete_children() {
    let parent = child_of(&top(), "rdc-parent");
    child_of(&parent, "rdc-child");
    parent.alloc(32).unwrap();

    parent.reset_and_delete_children();

    assert!(parent.children().is_empty());
    assert!(parent.is_empty());
    parent.delete();
}

#[test]
#[should_panic(expected = "top-most")]
fn test_delete_top_most_is_fatal() {
    top().delete();
}

#[test]
fn test_delete_current_is_fatal_and_leaves_tree_unchanged() {
    let parent = child_of(&top(), "current-parent");
    let child = child_of(&parent, "current-child");
    let grandchild = child_of(&child, "current-grandchild");

    let guard = grandchild.enter();
    let result = panic::catch_unwind(AssertUnwindSafe(|| parent.clone().delete()));
    assert!(result.is_err());

    assert_eq!(parent.children(), vec![child.clone()]);
    assert_eq!(child.children(), vec![grandchild.clone()]);
    assert!(!grandchild.is_deleted());

    drop(guard);
    parent.delete();
}

#[test]
#[should_panic(expected = "invalid memory context")]
fn test_use_after_delete_is_fatal() {
    let context = child_of(&top(), "use-after-delete");
    let stale = context.clone();
    context.delete();

    let _ = stale.alloc(8);
}

// ===== Current context =====

#[test]
fn test_switch_to_returns_previous() {
    let context = child_of(&top(), "switch");

    let previous = context.switch_to();
    assert_eq!(previous, top());
    assert_eq!(current_memory_context(), context);

    let restored = previous.switch_to();
    assert_eq!(restored, context);
    assert_eq!(current_memory_context(), top());

    context.delete();
}

#[test]
fn test_enter_restores_on_unwind() {
    let context = child_of(&top(), "enter-unwind");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _guard = context.enter();
        assert_eq!(current_memory_context(), context);
        panic!("unit of work aborted");
    }));

    assert!(result.is_err());
    assert_eq!(current_memory_context(), top());
    context.delete();
}

#[test]
fn test_error_context_is_reserved_child_of_top() {
    let error = error_context();
    assert!(error.is_shared());
    assert_eq!(error.parent(), Some(top()));
    // Other tests may be staging their own reports concurrently
    assert!((0..100).any(|_| stage_in_error_context("staged report")));
}

// ===== Diagnostics =====

#[cfg(any(debug_assertions, feature = "context-checking"))]
#[test]
fn test_stats_visits_parent_before_children() {
    let parent = child_of(&top(), "stats-parent");
    let child = child_of(&parent, "stats-child");
    child_of(&child, "stats-grandchild");
    parent.alloc(500).unwrap();

    let report = parent.stats();
    let names: Vec<_> = report.entries.iter().map(|entry| (entry.level, entry.name.as_str())).collect();
    assert_eq!(names, [(0, "stats-parent"), (1, "stats-child"), (2, "stats-grandchild")]);

    let parent_entry = report.find("stats-parent").unwrap();
    assert_eq!(parent_entry.counters.nblocks, 1);
    assert_eq!(report.grand_total().totalspace, parent_entry.counters.totalspace);

    let rendered = report.to_string();
    assert!(rendered.contains("\n  stats-child: "));
    assert!(rendered.contains("Grand total: "));

    parent.delete();
}

#[cfg(any(debug_assertions, feature = "context-checking"))]
#[test]
fn test_check_healthy_tree() {
    let parent = child_of(&top(), "check-parent");
    let child = child_of(&parent, "check-child");

    let small = parent.alloc(10).unwrap();
    child.alloc(20_000).unwrap();
    unsafe { pfree(small) };

    assert!(parent.check().is_empty());
    parent.delete();
}
