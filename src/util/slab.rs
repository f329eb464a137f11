use std::ptr::{self, NonNull};

use crate::transport::{LKey, Transport};
use crate::util::{buffer::Buffer, huge_alloc::*};

/// A slab allocator that hands out fixed-size units of registered memory and
/// never takes them back.
///
/// Used for long-lived datapath buffers such as the control-packet ring.
pub(crate) struct SlabAllocator {
    /// Backing regions, kept alive for the allocator's lifetime.
    regions: Vec<HugeRegion>,

    /// Unit length, rounded to a power of two.
    unit: usize,

    /// Next allocation site.
    next: *mut u8,

    /// End of the current region.
    end: *mut u8,

    /// Region handle of the current region.
    lkey: LKey,
}

impl SlabAllocator {
    const RESERVE_SIZE: usize = 1 << 20;

    /// Create a slab allocator of `unit_size`-byte units, with no pre-allocation.
    pub fn new(unit_size: usize) -> Self {
        let unit = unit_size.next_power_of_two();
        assert!(unit <= Self::RESERVE_SIZE, "slab unit too large");
        Self {
            regions: Vec::new(),
            unit,
            next: ptr::null_mut(),
            end: ptr::null_mut(),
            lkey: 0,
        }
    }

    /// Current region exhausted, so map and register a fresh one.
    #[cold]
    fn reserve_memory<Tp: Transport>(&mut self, tp: &mut Tp) -> Option<()> {
        let region = map_region(Self::RESERVE_SIZE)?;
        // SAFETY: the region was just mapped with this exact length.
        self.lkey = unsafe { tp.register(region.ptr, region.len) };
        self.next = region.ptr;
        // SAFETY: one-past-the-end pointer of the mapped region.
        self.end = unsafe { region.ptr.add(region.len) };
        self.regions.push(region);
        Some(())
    }

    /// Allocate one unit. Returns `None` when the backing pool cannot grow.
    pub fn alloc<Tp: Transport>(&mut self, tp: &mut Tp) -> Option<Buffer> {
        if self.next.is_null() || self.next == self.end {
            self.reserve_memory(tp)?;
        }

        let addr = self.next;
        // SAFETY: stays inside the current region; exhaustion checked above.
        self.next = unsafe { self.next.add(self.unit) };
        Some(Buffer::real(NonNull::new(addr).unwrap(), self.unit, self.lkey, None))
    }
}
