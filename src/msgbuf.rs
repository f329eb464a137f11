use std::ptr::NonNull;
use std::{cmp, mem, slice};

use crate::pkthdr::PacketHeader;
use crate::transport::LKey;
use crate::util::{buffer::Buffer, likely, roundup};

/// A message buffer: contiguous application payload with per-packet headers
/// interleaved at known offsets.
///
/// The first packet's header sits immediately before the payload; headers of
/// subsequent packets are stored after the (8-byte-rounded) payload region,
/// so that packet 0 is contiguous on the wire and later fragments are
/// gathered from (header, payload-slice) pairs.
///
/// Owned buffers are carved from the instance's registered memory and return
/// there on drop; borrowed buffers wrap transport receive units.
pub struct MsgBuf {
    /// Pointer to the first *application data* byte.
    data: NonNull<u8>,

    /// Max data bytes in the MsgBuf.
    max_len: usize,

    /// Valid data bytes in the MsgBuf.
    len: usize,

    /// Max number of packets in the MsgBuf.
    max_pkts: usize,

    /// Max data bytes per packet, from the owning transport.
    max_data: usize,

    /// Backing buffer.
    buffer: Buffer,
}

// SAFETY: a MsgBuf is owned by exactly one thread at a time; hand-off between
// the event loop and workers goes through the SPSC rings, which publish with
// release/acquire ordering.
unsafe impl Send for MsgBuf {}
unsafe impl Sync for MsgBuf {}

impl std::fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuf")
            .field("len", &self.len)
            .field("max_len", &self.max_len)
            .field("max_pkts", &self.max_pkts)
            .finish()
    }
}

/// Crate-internal methods.
impl MsgBuf {
    /// Number of packets needed for `len` data bytes at `max_data` bytes each.
    #[inline]
    pub(crate) fn pkts_for(len: usize, max_data: usize) -> usize {
        if len == 0 {
            1
        } else {
            (len - 1) / max_data + 1
        }
    }

    /// Bytes of backing buffer needed for a `len`-byte message, including the
    /// interleaved headers and the transport headroom.
    #[inline]
    pub(crate) fn buffer_size(len: usize, max_data: usize, headroom: usize) -> usize {
        headroom + roundup(len, 8) + Self::pkts_for(len, max_data) * mem::size_of::<PacketHeader>()
    }

    /// Create a MsgBuf on an owned buffer.
    pub(crate) fn owned(buf: Buffer, data_len: usize, max_data: usize, headroom: usize) -> Self {
        let max_pkts = Self::pkts_for(data_len, max_data);
        let overall = Self::buffer_size(data_len, max_data, headroom);
        assert!(
            overall <= buf.len(),
            "buffer too small: {} < {}",
            buf.len(),
            overall
        );

        Self {
            // SAFETY: guaranteed not null, stays inside the buffer.
            data: unsafe {
                NonNull::new_unchecked(
                    buf.as_ptr().add(headroom + mem::size_of::<PacketHeader>()),
                )
            },
            max_pkts,
            max_data,
            max_len: data_len,
            len: data_len,
            buffer: buf,
        }
    }

    /// Create a single-packet MsgBuf over memory this buffer does not own.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a valid `PacketHeader` placed right before `len`
    /// bytes of packet payload.
    pub(crate) unsafe fn borrowed(hdr: NonNull<u8>, len: usize, lkey: LKey) -> Self {
        Self {
            data: NonNull::new_unchecked(hdr.as_ptr().add(mem::size_of::<PacketHeader>())),
            max_pkts: 1,
            max_data: len.max(1),
            max_len: len,
            len,
            buffer: Buffer::fake(lkey),
        }
    }

    /// Get a pointer to the header of packet `pkt_idx`.
    #[inline]
    pub(crate) fn pkt_hdr(&self, pkt_idx: usize) -> *mut PacketHeader {
        debug_assert!(
            pkt_idx < self.max_pkts,
            "invalid packet index: max {}, got {}",
            self.max_pkts - 1,
            pkt_idx
        );

        // SAFETY: headers and application data live in the same allocation.
        let hdr = unsafe {
            if likely(pkt_idx == 0) {
                self.data.as_ptr().sub(mem::size_of::<PacketHeader>())
            } else {
                self.data
                    .as_ptr()
                    .add(roundup(self.max_len, 8) + (pkt_idx - 1) * mem::size_of::<PacketHeader>())
            }
        };
        hdr as _
    }

    /// Wire size of packet `pkt_idx` for the current data length.
    #[inline]
    pub(crate) fn pkt_size(&self, pkt_idx: usize) -> usize {
        debug_assert!(
            pkt_idx < self.max_pkts,
            "invalid packet index: max {}, got {}",
            self.max_pkts - 1,
            pkt_idx
        );

        let offset = pkt_idx * self.max_data;
        mem::size_of::<PacketHeader>() + cmp::min(self.max_data, self.len.saturating_sub(offset))
    }

    /// Number of packets for the current data length.
    #[inline]
    pub(crate) fn n_pkts(&self) -> usize {
        Self::pkts_for(self.len, self.max_data)
    }

    /// Max data bytes per packet.
    #[inline(always)]
    pub(crate) fn max_data_per_pkt(&self) -> usize {
        self.max_data
    }

    /// Get the memory handle of the backing buffer.
    #[inline(always)]
    pub(crate) fn lkey(&self) -> LKey {
        self.buffer.lkey()
    }
}

/// Public methods.
impl MsgBuf {
    /// Return a pointer to the first *application data* byte.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Return the length of application data.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if the buffer holds no application data.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the capacity of application data.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Set the application data length.
    ///
    /// # Panics
    ///
    /// Panic if `len` is larger than the capacity.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.max_len,
            "len {} > MsgBuf capacity {}",
            len,
            self.max_len
        );
        self.len = len;
    }

    /// View the application data as a `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`slice::from_raw_parts()`].
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// View the application data as a mutable `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`slice::from_raw_parts_mut()`].
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.len)
    }
}
