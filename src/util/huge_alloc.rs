use std::ptr;

use libc::*;

use crate::util::likely;

const HUGE_PAGE_SIZE: usize = 1 << 21;

enum RegionKind {
    Mapped,
    Heap,
}

/// A length-rounded memory region intended for NIC registration.
pub(crate) struct HugeRegion {
    pub ptr: *mut u8,
    pub len: usize,
    kind: RegionKind,
}

unsafe impl Send for HugeRegion {}
unsafe impl Sync for HugeRegion {}

impl Drop for HugeRegion {
    fn drop(&mut self) {
        // SAFETY: FFI; pointer and length come from the matching allocation.
        unsafe {
            match self.kind {
                RegionKind::Mapped => {
                    assert!(munmap(self.ptr as *mut c_void, self.len) == 0, "munmap failed")
                }
                RegionKind::Heap => free(self.ptr as *mut c_void),
            }
        };
    }
}

#[inline]
fn try_mmap(len: usize, flags: i32) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        ) as *mut u8
    };
    if ret != MAP_FAILED as _ {
        ret
    } else {
        ptr::null_mut()
    }
}

#[inline]
fn try_memalign(len: usize, align: usize) -> *mut u8 {
    let mut ptr = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { posix_memalign(&mut ptr, align, len) };
    if likely(ret == 0) {
        ptr as _
    } else {
        ptr::null_mut()
    }
}

/// Map a region of at least `len` bytes, preferring hugepages.
///
/// Falls back to normal pages and then to the libc heap. Returns `None` only
/// when every strategy fails, which callers surface as pool exhaustion.
pub(crate) fn map_region(len: usize) -> Option<HugeRegion> {
    // Roundup to huge page size.
    let len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

    let ptr = try_mmap(len, MAP_HUGETLB);
    if !ptr.is_null() {
        return Some(HugeRegion {
            ptr,
            len,
            kind: RegionKind::Mapped,
        });
    }

    log::warn!(
        "failed to mmap {}MB hugepages, trying normal pages; performance can be low",
        len >> 20
    );
    let ptr = try_mmap(len, 0);
    if likely(!ptr.is_null()) {
        return Some(HugeRegion {
            ptr,
            len,
            kind: RegionKind::Mapped,
        });
    }

    log::warn!(
        "failed to mmap {}MB normal pages, trying posix_memalign; performance can be low",
        len >> 20
    );
    let ptr = try_memalign(len, 1 << 12);
    if likely(!ptr.is_null()) {
        return Some(HugeRegion {
            ptr,
            len,
            kind: RegionKind::Heap,
        });
    }

    log::error!("failed to allocate {}MB of memory", len >> 20);
    None
}
