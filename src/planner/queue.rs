//! Single-producer single-consumer ring of blocks
//!
//! The planner context is the only producer; the stepper tick is the only
//! consumer. Capacity is a power of two so indices wrap with a mask, and
//! each side publishes its index with a release store that the other side
//! reads with an acquire load. That is the entire synchronization story
//! for the indices; block bodies follow the ownership protocol documented
//! on each accessor.

#![allow(unsafe_code)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::block::Block;
use super::trapezoid::Trapezoid;

/// Ring capacity. Must stay a power of two.
pub const BLOCK_BUFFER_SIZE: usize = 16;
const INDEX_MASK: usize = BLOCK_BUFFER_SIZE - 1;

/// Lock-free block ring.
///
/// Body access protocol, relied on by every `unsafe` below:
///
/// - The producer alone writes slots at `head` (before publishing) and
///   mutates planner-side fields of slots strictly between `tail` and
///   `head` via [`BlockQueue::with_plan_block`].
/// - The consumer alone mutates the slot at `tail` via
///   [`BlockQueue::with_current`], and alone advances `tail`.
/// - Trapezoid fields of any slot are rewritten only by
///   [`BlockQueue::commit_trapezoid`], inside a critical section that
///   masks the consumer, and only while the slot is not `busy`.
///
/// On the single-core targets this crate serves, the consumer runs in the
/// stepper interrupt: it preempts the producer but is never preempted by
/// it, and a critical section holds it off entirely.
pub struct BlockQueue {
    blocks: [UnsafeCell<Block>; BLOCK_BUFFER_SIZE],
    /// Next slot the producer will write
    head: AtomicUsize,
    /// Slot the consumer is executing or will execute next
    tail: AtomicUsize,
}

// SAFETY: shared access follows the SPSC protocol described above.
unsafe impl Sync for BlockQueue {}

impl BlockQueue {
    pub const fn new() -> Self {
        Self {
            blocks: [const { UnsafeCell::new(Block::EMPTY) }; BLOCK_BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub(crate) const fn next_index(index: usize) -> usize {
        (index + 1) & INDEX_MASK
    }

    pub(crate) const fn prev_index(index: usize) -> usize {
        index.wrapping_sub(1) & INDEX_MASK
    }

    pub(crate) const fn back_index(index: usize, count: usize) -> usize {
        index.wrapping_sub(count) & INDEX_MASK
    }

    pub(crate) fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// True when no blocks are queued
    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    /// True when pushing one more block would overwrite the tail
    pub fn is_full(&self) -> bool {
        Self::next_index(self.head()) == self.tail()
    }

    /// Number of queued blocks
    pub fn len(&self) -> usize {
        self.head().wrapping_sub(self.tail()) & INDEX_MASK
    }

    /// Producer: publish a fully-built block.
    ///
    /// Returns `false` without touching the ring if it is full.
    pub(crate) fn push(&self, block: Block) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        if Self::next_index(head) == self.tail() {
            return false;
        }
        // SAFETY: `head` is not visible to the consumer until the store
        // below, and the producer is the only writer of unpublished slots.
        unsafe {
            *self.blocks[head].get() = block;
        }
        self.head.store(Self::next_index(head), Ordering::Release);
        true
    }

    /// Producer: read or adjust the planner-side fields of a queued block.
    ///
    /// Callers must pass indices in `tail..head` obtained in the same
    /// planning pass; trapezoid fields must go through
    /// [`BlockQueue::commit_trapezoid`] instead.
    pub(crate) fn with_plan_block<R>(&self, index: usize, f: impl FnOnce(&mut Block) -> R) -> R {
        // SAFETY: producer-only access per the ring protocol; the consumer
        // touches the tail slot only, and planner-side fields are never
        // read by the consumer at all.
        f(unsafe { &mut *self.blocks[index & INDEX_MASK].get() })
    }

    /// Producer: rewrite the trapezoid of a queued block, skipping the
    /// update if the consumer has started executing it.
    ///
    /// Returns `true` when the commit landed.
    pub(crate) fn commit_trapezoid(&self, index: usize, trapezoid: &Trapezoid) -> bool {
        critical_section::with(|_| {
            // SAFETY: the consumer is masked for the duration of this
            // closure, and the busy check keeps us off an executing block.
            let block = unsafe { &mut *self.blocks[index & INDEX_MASK].get() };
            if block.busy {
                return false;
            }
            block.accelerate_until = trapezoid.accelerate_until;
            block.decelerate_after = trapezoid.decelerate_after;
            block.initial_rate = trapezoid.initial_rate;
            block.final_rate = trapezoid.final_rate;
            block.initial_advance = trapezoid.initial_advance;
            block.final_advance = trapezoid.final_advance;
            true
        })
    }

    /// Consumer: run `f` on the oldest queued block, if any
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&mut Block) -> R) -> Option<R> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head() {
            return None;
        }
        // SAFETY: the consumer alone accesses the tail slot; producer
        // writes to it are excluded by the ring protocol (a slot is only
        // written before publication or through the masked commit).
        Some(f(unsafe { &mut *self.blocks[tail].get() }))
    }

    /// Consumer: retire the oldest block
    pub(crate) fn discard_current(&self) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail != self.head() {
            self.tail.store(Self::next_index(tail), Ordering::Release);
        }
    }

    /// Drop every queued block. Caller must hold the consumer off (quick
    /// stop loads the cleaning counter first); the ring itself just snaps
    /// `tail` to `head` inside a critical section.
    pub(crate) fn clear(&self) {
        critical_section::with(|_| {
            self.tail.store(self.head.load(Ordering::Relaxed), Ordering::Release);
        });
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with_count(count: u32) -> Block {
        Block {
            step_event_count: count,
            ..Block::EMPTY
        }
    }

    #[test]
    fn test_starts_empty() {
        let queue = BlockQueue::new();
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 0);
        assert!(queue.with_current(|_| ()).is_none());
    }

    #[test]
    fn test_fifo_order() {
        let queue = BlockQueue::new();
        assert!(queue.push(block_with_count(1)));
        assert!(queue.push(block_with_count(2)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.with_current(|b| b.step_event_count), Some(1));
        queue.discard_current();
        assert_eq!(queue.with_current(|b| b.step_event_count), Some(2));
        queue.discard_current();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_rejects_push() {
        let queue = BlockQueue::new();
        for i in 0..BLOCK_BUFFER_SIZE - 1 {
            assert!(queue.push(block_with_count(i as u32)));
        }
        assert!(queue.is_full());
        assert!(!queue.push(block_with_count(99)));
        // The tail block is untouched
        assert_eq!(queue.with_current(|b| b.step_event_count), Some(0));
    }

    #[test]
    fn test_wraps_around() {
        let queue = BlockQueue::new();
        for round in 0..3 * BLOCK_BUFFER_SIZE as u32 {
            assert!(queue.push(block_with_count(round)));
            assert_eq!(queue.with_current(|b| b.step_event_count), Some(round));
            queue.discard_current();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_commit_skips_busy_block() {
        let queue = BlockQueue::new();
        queue.push(block_with_count(100));
        let trapezoid = Trapezoid {
            accelerate_until: 10,
            decelerate_after: 90,
            initial_rate: 120,
            final_rate: 120,
            initial_advance: 0,
            final_advance: 0,
        };
        let tail = queue.tail();
        assert!(queue.commit_trapezoid(tail, &trapezoid));
        assert_eq!(queue.with_current(|b| b.accelerate_until), Some(10));

        queue.with_current(|b| b.busy = true);
        let stale = Trapezoid {
            accelerate_until: 55,
            ..trapezoid
        };
        assert!(!queue.commit_trapezoid(tail, &stale));
        assert_eq!(queue.with_current(|b| b.accelerate_until), Some(10));
    }

    #[test]
    fn test_clear_empties_ring() {
        let queue = BlockQueue::new();
        for i in 0..5 {
            queue.push(block_with_count(i));
        }
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.with_current(|_| ()).is_none());
    }
}
