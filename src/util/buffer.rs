use std::ptr::NonNull;
use std::sync::Arc;

use crate::transport::LKey;
use crate::util::buddy::BuddyAllocator;

/// A raw registered buffer handed out by an allocator.
///
/// Buffers backed by the buddy allocator return themselves to it on drop;
/// slab-backed and fake buffers do nothing.
pub(crate) struct Buffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Length of the buffer.
    len: usize,

    /// Memory region handle.
    lkey: LKey,

    /// The buddy allocator to return this buffer to, if any.
    owner: Option<Arc<BuddyAllocator>>,
}

impl Buffer {
    /// A real buffer, possibly owned by a buddy allocator.
    #[inline]
    pub fn real(buf: NonNull<u8>, len: usize, lkey: LKey, owner: Option<Arc<BuddyAllocator>>) -> Self {
        Self {
            buf,
            len,
            lkey,
            owner,
        }
    }

    /// A fake buffer that only records an LKey and does nothing when dropped.
    #[inline]
    pub fn fake(lkey: LKey) -> Self {
        Self {
            buf: NonNull::dangling(),
            len: 0,
            lkey,
            owner: None,
        }
    }

    /// Get the start address of the buffer.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Get the length of the buffer.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the memory region handle of the buffer.
    #[inline(always)]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.give_back(self.buf, self.len, self.lkey);
        }
    }
}
