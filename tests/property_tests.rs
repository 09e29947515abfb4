//! Property tests over random allocation workloads

use memctx::{
    ensure_initialized, get_memory_chunk_context, get_memory_chunk_space, pfree, repalloc,
    top_most_memory_context, AllocSet, AllocSetSizes, MemoryContext,
};
use proptest::prelude::*;
use std::slice;

fn scratch(name: &str) -> MemoryContext {
    ensure_initialized();
    AllocSet::create(Some(&top_most_memory_context()), name, AllocSetSizes::SMALL, false).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Realloc(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..20_000).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
        1 => (any::<usize>(), 0usize..20_000).prop_map(|(i, size)| Op::Realloc(i, size)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn alloc_recovers_owner_and_space(sizes in prop::collection::vec(0usize..40_000, 1..50)) {
        let context = scratch("prop-owner");

        for size in sizes {
            let pointer = context.alloc(size).unwrap();
            unsafe {
                prop_assert_eq!(get_memory_chunk_context(pointer), context.clone());
                prop_assert!(get_memory_chunk_space(pointer) >= size);
                prop_assert!(context.contains(pointer.as_ptr()));
            }
        }

        context.delete();
    }

    #[test]
    fn random_workload_keeps_contents(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let context = scratch("prop-workload");
        let mut live: Vec<(std::ptr::NonNull<u8>, usize, u8)> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            let tag = (step % 251) as u8;
            match op {
                Op::Alloc(size) => {
                    let pointer = context.alloc(size).unwrap();
                    unsafe { pointer.as_ptr().write_bytes(tag, size) };
                    live.push((pointer, size, tag));
                }
                Op::Free(index) if !live.is_empty() => {
                    let (pointer, _, _) = live.swap_remove(index % live.len());
                    unsafe { pfree(pointer) };
                }
                Op::Realloc(index, size) if !live.is_empty() => {
                    let slot = index % live.len();
                    let (pointer, old_size, old_tag) = live[slot];
                    let moved = unsafe { repalloc(pointer, size) }.unwrap();

                    let kept = old_size.min(size);
                    let bytes = unsafe { slice::from_raw_parts(moved.as_ptr(), kept) };
                    prop_assert!(bytes.iter().all(|&b| b == old_tag));

                    unsafe { moved.as_ptr().write_bytes(tag, size) };
                    live[slot] = (moved, size, tag);
                }
                _ => {}
            }
        }

        for &(pointer, size, tag) in &live {
            let bytes = unsafe { slice::from_raw_parts(pointer.as_ptr(), size) };
            prop_assert!(bytes.iter().all(|&b| b == tag));
        }

        #[cfg(debug_assertions)]
        prop_assert!(context.check().is_empty());

        context.reset();
        prop_assert!(context.is_empty());
        context.delete();
    }

    #[test]
    fn strndup_round_trip(bytes in prop::collection::vec(1u8..=255, 0..300)) {
        let context = scratch("prop-strndup");

        let pointer = context.strndup(&bytes).unwrap();
        let copied = unsafe { slice::from_raw_parts(pointer.as_ptr(), bytes.len() + 1) };
        prop_assert_eq!(&copied[..bytes.len()], &bytes[..]);
        prop_assert_eq!(copied[bytes.len()], 0);

        context.delete();
    }
}
