//! Chase-Lev work-stealing deque
//!
//! The scheduling primitive under a worker pool: each worker owns one deque
//! and pushes/pops work at the bottom (LIFO, cache-friendly), while other
//! workers steal from the top (FIFO, fair). Based on "Dynamic Circular
//! Work-Stealing Deque" (Chase & Lev, 2005).
//!
//! Rust hosts run workers on real OS threads, so the top/bottom counters
//! use real atomics with a compare-exchange on `top` deciding the race on
//! the last element: exactly one of a concurrent `pop` and `steal` wins,
//! the loser observes an empty deque. The circular buffer doubles when the
//! owner's push would overflow it; replaced buffers are retired, not freed,
//! until the deque drops, so an in-flight steal never reads freed memory.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Scheduling priority of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One unit of queued work
///
/// Owned exclusively by whichever deque currently holds it; ownership
/// transfers atomically on steal.
#[derive(Debug)]
pub struct WorkItem<T> {
    pub payload: T,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

impl<T> WorkItem<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            priority: Priority::Normal,
            enqueued_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Power-of-two circular buffer of uninitialized slots
struct Buffer<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<WorkItem<T>>>]>,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: capacity - 1,
            slots,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bitwise-copy the item at `index` out of the buffer.
    ///
    /// Safety: the slot must hold an initialized item, and the logical
    /// ownership protocol (CAS on `top`) must ensure only one reader keeps
    /// the copy.
    unsafe fn read(&self, index: isize) -> WorkItem<T> {
        let slot = self.slots[index as usize & self.mask].get();
        (*slot).assume_init_read()
    }

    /// Safety: the slot must be unused (outside the live top..bottom range).
    unsafe fn write(&self, index: isize, item: WorkItem<T>) {
        let slot = self.slots[index as usize & self.mask].get();
        (*slot).write(item);
    }
}

struct Inner<T> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by growth, kept alive for concurrent stealers.
    retired: Mutex<Vec<*mut Buffer<T>>>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        let bottom = *self.bottom.get_mut();
        let buffer = *self.buffer.get_mut();
        unsafe {
            for i in top..bottom {
                drop((*buffer).read(i));
            }
            drop(Box::from_raw(buffer));
            for retired in self.retired.get_mut().drain(..) {
                // Items were moved out when the buffer was replaced.
                drop(Box::from_raw(retired));
            }
        }
    }
}

/// Owner handle: push and pop at the bottom
///
/// Not cloneable; exactly one worker owns the deque. Hand out [`Stealer`]s
/// to everyone else.
pub struct WorkStealingDeque<T> {
    inner: Arc<Inner<T>>,
}

/// Thief handle: steal from the top
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

const DEFAULT_CAPACITY: usize = 32;

impl<T> Default for WorkStealingDeque<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> WorkStealingDeque<T> {
    /// Create a deque. `initial_capacity` is rounded up to a power of two.
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(2).next_power_of_two();
        let buffer = Box::into_raw(Box::new(Buffer::new(capacity)));
        Self {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicIsize::new(0)),
                bottom: CachePadded::new(AtomicIsize::new(0)),
                buffer: AtomicPtr::new(buffer),
                retired: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A new thief handle for this deque.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Push onto the bottom (owner only).
    pub fn push(&mut self, item: WorkItem<T>) {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Acquire);
        let mut buffer = self.inner.buffer.load(Ordering::Relaxed);

        let size = b - t;
        if size >= unsafe { (*buffer).capacity() } as isize - 1 {
            self.grow(b, t);
            buffer = self.inner.buffer.load(Ordering::Relaxed);
        }

        unsafe { (*buffer).write(b, item) };
        fence(Ordering::Release);
        self.inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Pop from the bottom (owner only). LIFO.
    pub fn pop(&mut self) -> Option<WorkItem<T>> {
        let b = self.inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.inner.buffer.load(Ordering::Relaxed);
        self.inner.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.inner.top.load(Ordering::Relaxed);

        let size = b - t;
        if size < 0 {
            // Already empty; restore the published bottom.
            self.inner.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        let item = unsafe { (*buffer).read(b) };
        if size > 0 {
            return Some(item);
        }

        // Single remaining element: race any stealer for it via `top`.
        let won = self
            .inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.inner.bottom.store(t + 1, Ordering::Relaxed);
        if won {
            Some(item)
        } else {
            // A thief claimed it first; it owns the copy now.
            std::mem::forget(item);
            None
        }
    }

    /// Items currently queued. Approximate under concurrency.
    pub fn len(&self) -> usize {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Double the buffer, moving the live range into the new one. The old
    /// buffer is retired so concurrent stealers can still read from it.
    fn grow(&mut self, b: isize, t: isize) {
        let old = self.inner.buffer.load(Ordering::Relaxed);
        let new = unsafe {
            let new = Box::into_raw(Box::new(Buffer::new((*old).capacity() * 2)));
            for i in t..b {
                (*new).write(i, (*old).read(i));
            }
            new
        };
        self.inner.buffer.store(new, Ordering::Release);
        self.inner.retired.lock().push(old);
    }
}

impl<T> Stealer<T> {
    /// Steal from the top. FIFO.
    ///
    /// On the last element this races the owner's `pop`; the compare-
    /// exchange on `top` picks exactly one winner and the loser sees empty.
    pub fn steal(&self) -> Option<WorkItem<T>> {
        let t = self.inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.inner.bottom.load(Ordering::Acquire);

        if b - t <= 0 {
            return None;
        }

        let buffer = self.inner.buffer.load(Ordering::Acquire);
        let item = unsafe { (*buffer).read(t) };

        if self
            .inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(item)
        } else {
            // Lost to the owner or another thief.
            std::mem::forget(item);
            None
        }
    }

    /// Approximate queue length, for victim selection.
    pub fn len(&self) -> usize {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;

    #[test]
    fn test_owner_pop_is_lifo() {
        let mut deque = WorkStealingDeque::new(8);
        for i in 0..3 {
            deque.push(WorkItem::new(i));
        }

        assert_eq!(deque.pop().unwrap().payload, 2);
        assert_eq!(deque.pop().unwrap().payload, 1);
        assert_eq!(deque.pop().unwrap().payload, 0);
        assert!(deque.pop().is_none());
    }

    #[test]
    fn test_steal_is_fifo() {
        let mut deque = WorkStealingDeque::new(8);
        let stealer = deque.stealer();
        for i in 0..3 {
            deque.push(WorkItem::new(i));
        }

        assert_eq!(stealer.steal().unwrap().payload, 0);
        assert_eq!(stealer.steal().unwrap().payload, 1);
        assert_eq!(stealer.steal().unwrap().payload, 2);
        assert!(stealer.steal().is_none());
    }

    #[test]
    fn test_growth_preserves_items() {
        let mut deque = WorkStealingDeque::new(2);
        for i in 0..100 {
            deque.push(WorkItem::new(i));
        }
        assert_eq!(deque.len(), 100);

        let mut seen = Vec::new();
        while let Some(item) = deque.pop() {
            seen.push(item.payload);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_priority_and_timestamp_carried() {
        let item = WorkItem::new("job").with_priority(Priority::High);
        assert_eq!(item.priority, Priority::High);
        assert!(item.enqueued_at.elapsed().as_secs() < 1);
    }

    #[test]
    fn test_single_item_race_has_one_winner() {
        // The core correctness property: concurrent pop and steal on a
        // deque holding exactly one item never both succeed.
        for _ in 0..500 {
            let mut deque = WorkStealingDeque::new(8);
            let stealer = deque.stealer();
            deque.push(WorkItem::new(42usize));

            let barrier = Barrier::new(2);
            let stolen = AtomicBool::new(false);
            let popped = std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    if stealer.steal().is_some() {
                        stolen.store(true, Ordering::SeqCst);
                    }
                });
                barrier.wait();
                deque.pop().is_some()
            });

            let winners = popped as usize + stolen.load(Ordering::SeqCst) as usize;
            assert_eq!(winners, 1, "exactly one side must win the last item");
        }
    }

    #[test]
    fn test_concurrent_drain_conserves_items() {
        const ITEMS: usize = 10_000;
        let mut deque = WorkStealingDeque::new(4);
        let stealers: Vec<_> = (0..3).map(|_| deque.stealer()).collect();

        for i in 0..ITEMS {
            deque.push(WorkItem::new(i));
        }

        let mut collected: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = stealers
                .into_iter()
                .map(|stealer| {
                    scope.spawn(move || {
                        let mut taken = Vec::new();
                        loop {
                            match stealer.steal() {
                                Some(item) => taken.push(item.payload),
                                None => {
                                    if stealer.is_empty() {
                                        break;
                                    }
                                }
                            }
                        }
                        taken
                    })
                })
                .collect();

            let mut owned = Vec::new();
            while let Some(item) = deque.pop() {
                owned.push(item.payload);
            }

            let mut all = owned;
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
            all
        });

        // Every item drained exactly once: no loss, no duplication.
        assert_eq!(collected.len(), ITEMS);
        let unique: HashSet<_> = collected.drain(..).collect();
        assert_eq!(unique.len(), ITEMS);
    }

    #[test]
    fn test_drop_releases_undrained_items() {
        // Items left in the deque (including pre-growth buffers) are
        // dropped with it; Arc payloads prove nothing leaks or double-drops.
        let payload = Arc::new(());
        {
            let mut deque = WorkStealingDeque::new(2);
            for _ in 0..50 {
                deque.push(WorkItem::new(Arc::clone(&payload)));
            }
            let _ = deque.pop();
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
