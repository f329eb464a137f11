use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// A bounded single-producer/single-consumer ring with atomic head/tail.
///
/// `push` must only ever be called from one thread at a time, and `pop` from
/// one thread at a time; the two sides may be different threads. The engine
/// upholds this by construction: each ring connects exactly one event loop
/// and one worker (or an event loop to itself).
pub(crate) struct Spsc<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Published by the producer.
    head: CachePadded<AtomicUsize>,
    /// Published by the consumer.
    tail: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    mask: usize,
}

unsafe impl<T: Send> Send for Spsc<T> {}
unsafe impl<T: Send> Sync for Spsc<T> {}

impl<T> Spsc<T> {
    /// Create a ring holding up to `capacity - 1` items. `capacity` must be a
    /// power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            buf: buf.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            mask: capacity - 1,
        }
    }

    /// Enqueue a value. Fails when the ring is full or closed.
    pub fn push(&self, value: T) -> Result<(), T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(value);
        }
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > self.mask {
            return Err(value);
        }

        // SAFETY: the slot between tail and head+1 is not visible to the
        // consumer until the store below, and there is a single producer.
        unsafe {
            (*self.buf[head & self.mask].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue a value, if any.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        // SAFETY: the producer published this slot and will not touch it
        // again until the store below frees it; there is a single consumer.
        let value = unsafe { (*self.buf[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Return `true` if there is nothing to pop.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }

    /// Refuse further pushes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Return `true` if the ring has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for Spsc<T> {
    fn drop(&mut self) {
        // Sole owner at this point; drain whatever was left behind.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_drain() {
        let ring = Spsc::new(8);
        for i in 0..7 {
            ring.push(i).unwrap();
        }
        assert!(ring.push(7).is_err(), "ring should be full");

        for i in 0..7 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraparound() {
        let ring = Spsc::new(4);
        for round in 0..10 {
            ring.push(round * 2).unwrap();
            ring.push(round * 2 + 1).unwrap();
            assert_eq!(ring.pop(), Some(round * 2));
            assert_eq!(ring.pop(), Some(round * 2 + 1));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn closed_rejects() {
        let ring = Spsc::new(4);
        ring.push(1).unwrap();
        ring.close();
        assert!(ring.push(2).is_err());
        assert_eq!(ring.pop(), Some(1));
    }

    #[test]
    fn cross_thread() {
        use std::sync::Arc;
        let ring = Arc::new(Spsc::new(64));
        let tx = ring.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..1000u64 {
                loop {
                    if tx.push(i).is_ok() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });

        let mut expect = 0u64;
        while expect < 1000 {
            if let Some(v) = ring.pop() {
                assert_eq!(v, expect);
                expect += 1;
            }
        }
        producer.join().unwrap();
    }
}
