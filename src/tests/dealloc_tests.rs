use std::vec::Vec;

use rand::seq::SliceRandom;

use super::*;

#[test]
fn release_with_both_neighbors_used_only_inserts() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let _a = guard.heap.allocate(24).unwrap();
    let b = guard.heap.allocate(24).unwrap();
    let _c = guard.heap.allocate(24).unwrap();

    unsafe { guard.heap.release(b) };

    assert_only_1_free_block(&guard, 32);
}

#[test]
fn release_absorbs_a_free_right_neighbor() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let _a = guard.heap.allocate(24).unwrap();
    let b = guard.heap.allocate(24).unwrap();
    let c = guard.heap.allocate(24).unwrap();

    unsafe { guard.heap.release(c) };
    assert_only_1_free_block(&guard, 32);

    unsafe { guard.heap.release(b) };
    assert_only_1_free_block(&guard, 64);
}

#[test]
fn release_absorbs_into_a_free_left_neighbor() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let a = guard.heap.allocate(24).unwrap();
    let b = guard.heap.allocate(24).unwrap();
    let _c = guard.heap.allocate(24).unwrap();

    unsafe { guard.heap.release(a) };
    assert_only_1_free_block(&guard, 32);

    unsafe { guard.heap.release(b) };
    assert_only_1_free_block(&guard, 64);

    // the merged block keeps the left neighbor's identity
    let reused = guard.heap.allocate(56).unwrap();
    assert_eq!(reused, a);
    guard.check();
}

#[test]
fn release_absorbs_both_free_neighbors_in_one_merge() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let a = guard.heap.allocate(24).unwrap();
    let b = guard.heap.allocate(24).unwrap();
    let c = guard.heap.allocate(24).unwrap();
    let _d = guard.heap.allocate(24).unwrap();

    unsafe {
        guard.heap.release(a);
        guard.heap.release(c);
    }
    let stats = guard.check();
    assert_eq!(stats.free_blocks, 2);

    unsafe { guard.heap.release(b) };
    assert_only_1_free_block(&guard, 96);
}

#[test]
fn release_updates_the_next_blocks_prev_free_flag() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let a = guard.heap.allocate(24).unwrap();
    let b = guard.heap.allocate(24).unwrap();

    unsafe { guard.heap.release(a) };

    let b_block = guard
        .heap
        .blocks()
        .find(|info| info.addr == b.as_ptr() as usize - WORD_SIZE)
        .unwrap();
    assert!(b_block.prev_free);
    guard.check();
}

#[test]
fn release_everything_coalesces_to_a_single_block() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let allocations: Vec<_> = (0..16)
        .map(|_| guard.heap.allocate(24).unwrap())
        .collect();

    for allocation in allocations {
        unsafe { guard.heap.release(allocation) };
        guard.check();
    }

    assert_only_1_free_block(&guard, 16 * 32);
}

#[test]
fn release_everything_in_random_order_coalesces_to_a_single_block() {
    let mut guard = HeapInitGuard::empty();
    guard.init(4096);

    let mut allocations: Vec<_> = (0..16)
        .map(|_| guard.heap.allocate(24).unwrap())
        .collect();

    let mut rng = rand::thread_rng();
    allocations.shuffle(&mut rng);

    for allocation in allocations {
        unsafe { guard.heap.release(allocation) };
        guard.check();
    }

    assert_only_1_free_block(&guard, 16 * 32);
}
