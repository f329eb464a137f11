use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::transport::{LKey, Transport};
use crate::util::{buffer::Buffer, huge_alloc::*};

/// An unallocated span in the buddy system.
///
/// Carries no length; the size class it sits in determines that.
struct FreeSpan {
    /// Start address.
    buf: NonNull<u8>,

    /// Region handle under which this span was registered.
    lkey: LKey,
}

// Spans only ever reference registered regions kept alive by the allocator.
unsafe impl Send for FreeSpan {}

impl FreeSpan {
    #[inline(always)]
    fn new(buf: NonNull<u8>, lkey: LKey) -> Self {
        Self { buf, lkey }
    }

    /// Return a span starting at an offset into this one.
    ///
    /// # Safety
    ///
    /// Same as [`pointer::add()`](https://doc.rust-lang.org/std/primitive.pointer.html#method.add).
    #[inline(always)]
    unsafe fn offset(&self, offset: usize) -> FreeSpan {
        FreeSpan {
            buf: NonNull::new_unchecked(self.buf.as_ptr().add(offset)),
            lkey: self.lkey,
        }
    }
}

struct BuddyInner {
    /// Free lists, one per size class.
    buddy: [Vec<FreeSpan>; BuddyAllocator::NUM_CLASSES],

    /// Backing regions, kept alive for the allocator's lifetime.
    #[allow(dead_code)]
    regions: Vec<HugeRegion>,

    /// Next backing-region size.
    next_reserve: usize,
}

impl BuddyInner {
    /// All free lists for the requested class are empty, so back the
    /// allocator with a fresh registered region.
    #[cold]
    fn reserve_memory<Tp: Transport>(&mut self, tp: &mut Tp) -> Result<()> {
        let len = self.next_reserve;
        debug_assert!(len % BuddyAllocator::MAX_ALLOC_SIZE == 0);

        let region = map_region(len).ok_or(Error::OutOfMemory)?;
        self.next_reserve *= 2;

        // SAFETY: the region was just mapped with this exact length.
        let lkey = unsafe { tp.register(region.ptr, region.len) };
        for i in 0..(region.len / BuddyAllocator::MAX_ALLOC_SIZE) {
            self.buddy[BuddyAllocator::NUM_CLASSES - 1].push(FreeSpan::new(
                // SAFETY: guaranteed not null, stays inside the region.
                unsafe { NonNull::new_unchecked(region.ptr.add(i * BuddyAllocator::MAX_ALLOC_SIZE)) },
                lkey,
            ));
        }
        self.regions.push(region);
        Ok(())
    }

    /// Split one span of `class` into two spans of the class below.
    #[inline]
    fn split(&mut self, class: usize) {
        debug_assert!((1..BuddyAllocator::NUM_CLASSES).contains(&class));
        debug_assert!(!self.buddy[class].is_empty());

        let half = BuddyAllocator::size_of_class(class - 1);
        let lo = self.buddy[class].pop().unwrap();

        // SAFETY: both halves stay inside the original span.
        let hi = unsafe { lo.offset(half) };
        self.buddy[class - 1].push(lo);
        self.buddy[class - 1].push(hi);
    }
}

/// A buddy allocator over registered hugepage regions.
///
/// Buddies are never coalesced; freed spans simply return to their class's
/// free list. Buffers keep an `Arc` to the allocator, so outstanding message
/// buffers pin both the allocator and its registered regions.
pub(crate) struct BuddyAllocator {
    inner: Mutex<BuddyInner>,
}

impl BuddyAllocator {
    const MIN_ALLOC_SIZE: usize = 1 << 6;

    /// The maximum allocation size, 32MB.
    pub const MAX_ALLOC_SIZE: usize = 1 << 25;

    const NUM_CLASSES: usize =
        (Self::MAX_ALLOC_SIZE / Self::MIN_ALLOC_SIZE).trailing_zeros() as usize + 1;

    /// Return the span size of a given class.
    #[inline]
    const fn size_of_class(class: usize) -> usize {
        Self::MIN_ALLOC_SIZE << class
    }

    /// Return the smallest class that can accommodate `len` bytes.
    #[inline]
    const fn class_of(len: usize) -> usize {
        let len = len.next_power_of_two();
        if len < Self::MIN_ALLOC_SIZE {
            0
        } else {
            (len / Self::MIN_ALLOC_SIZE).trailing_zeros() as usize
        }
    }

    /// Create a new buddy allocator with no pre-allocation.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BuddyInner {
                buddy: Default::default(),
                regions: Vec::new(),
                next_reserve: Self::MAX_ALLOC_SIZE,
            }),
        })
    }

    /// Allocate a buffer of at least `len` bytes of registered memory.
    /// The buffer pins `this` until it drops.
    pub fn alloc<Tp: Transport>(this: &Arc<Self>, len: usize, tp: &mut Tp) -> Result<Buffer> {
        if len > Self::MAX_ALLOC_SIZE {
            return Err(Error::TooLarge);
        }

        let mut inner = this.inner.lock().unwrap();
        let class = Self::class_of(len);
        if inner.buddy[class].is_empty() {
            let higher = ((class + 1)..Self::NUM_CLASSES).find(|&c| !inner.buddy[c].is_empty());
            let higher = match higher {
                Some(c) => c,
                None => {
                    inner.reserve_memory(tp)?;
                    Self::NUM_CLASSES - 1
                }
            };

            debug_assert!(!inner.buddy[higher].is_empty());
            for c in ((class + 1)..=higher).rev() {
                inner.split(c);
            }
            debug_assert!(!inner.buddy[class].is_empty());
        }

        let span = inner.buddy[class].pop().unwrap();
        Ok(Buffer::real(
            span.buf,
            Self::size_of_class(class),
            span.lkey,
            Some(this.clone()),
        ))
    }

    /// Return a span to its free list. Called from [`Buffer`]'s drop.
    pub fn give_back(&self, buf: NonNull<u8>, len: usize, lkey: LKey) {
        let class = Self::class_of(len);
        debug_assert_eq!(Self::size_of_class(class), len, "freeing an odd-sized span");
        self.inner.lock().unwrap().buddy[class].push(FreeSpan::new(buf, lkey));
    }
}
