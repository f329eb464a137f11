use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            #[inline(always)]
            pub fn [< set_ $field >](&mut self, val: $field_ty) {
                self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
            }

            #[inline(always)]
            pub fn $field(&self) -> $field_ty {
                self.bits[$lsb..=$msb].load_le::<$integral_ty>() as $field_ty
            }
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        impl_accessor!($field, $field_ty, $field_ty, $lsb, $msb);
    };
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Request data.
    Req = 0,

    /// Response data.
    Resp = 1,

    /// Request for response: pull the next response segment.
    Rfr = 2,

    /// Explicit credit return for a multi-packet request.
    ExplCr = 3,
}

impl PktType {
    /// Decode a validated 4-bit field.
    ///
    /// # Panics
    ///
    /// Panic on values other than the four wire types. Receive paths must
    /// gate on [`PacketHeader::validate()`] first.
    #[inline]
    fn from_bits(val: u8) -> Self {
        match val {
            0 => Self::Req,
            1 => Self::Resp,
            2 => Self::Rfr,
            3 => Self::ExplCr,
            _ => unreachable!("unvalidated packet type {val}"),
        }
    }
}

/// Maximum message size expressible in the 24-bit length field.
pub(crate) const MAX_MSG_SIZE: usize = (1 << 24) - 1;

/// Maximum packet index expressible in the 12-bit index field.
pub(crate) const MAX_PKT_IDX: PktIdx = (1 << 12) - 1;

type HdrBits = bv::BitArr!(for 128, in u8, bv::Lsb0);

/// Packet header, 16 bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | req_type     |
/// |   8 |  31 | msg_size     |
/// |  32 |  47 | dst_sess_id  |
/// |  48 |  51 | pkt_type     |
/// |  52 |  63 | pkt_idx      |
/// |  64 | 127 | req_idx      |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PacketHeader {
    bits: HdrBits,
}

impl PacketHeader {
    impl_accessor!(req_type, ReqType, 0, 7);
    impl_accessor!(msg_size, u32, 8, 31);
    impl_accessor!(dst_sess_id, SessId, 32, 47);
    impl_accessor!(pkt_idx, PktIdx, 52, 63);
    impl_accessor!(req_idx, ReqIdx, 64, 127);

    #[inline(always)]
    pub fn set_pkt_type(&mut self, val: PktType) {
        self.bits[48..=51].store_le::<u8>(val as u8);
    }

    #[inline(always)]
    pub fn pkt_type(&self) -> PktType {
        PktType::from_bits(self.bits[48..=51].load_le::<u8>())
    }

    pub fn new(
        req_type: ReqType,
        msg_size: u32,
        dst_sess_id: SessId,
        pkt_type: PktType,
        pkt_idx: PktIdx,
        req_idx: ReqIdx,
    ) -> Self {
        debug_assert!(msg_size as usize <= MAX_MSG_SIZE);
        debug_assert!(pkt_idx <= MAX_PKT_IDX);

        let mut this = Self::default();
        this.set_req_type(req_type);
        this.set_msg_size(msg_size);
        this.set_dst_sess_id(dst_sess_id);
        this.set_pkt_type(pkt_type);
        this.set_pkt_idx(pkt_idx);
        this.set_req_idx(req_idx);
        this
    }

    /// Check the well-formedness of a header read off the wire.
    /// Malformed headers are dropped silently by the receive path.
    #[inline]
    pub fn validate(&self) -> bool {
        self.bits[48..=51].load_le::<u8>() <= PktType::ExplCr as u8
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("req_type", &self.req_type())
            .field("msg_size", &self.msg_size())
            .field("dst_sess_id", &self.dst_sess_id())
            .field("pkt_type", &self.pkt_type())
            .field("pkt_idx", &self.pkt_idx())
            .field("req_idx", &self.req_idx())
            .finish()
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            bits: bv::BitArray::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<PacketHeader>(), 16);
        assert_eq!(mem::align_of::<PacketHeader>(), 1);
    }

    #[test]
    fn roundtrip() {
        let hdr = PacketHeader::new(42, 0xAB_CDEF, 0x1234, PktType::Rfr, 0xFFF, u64::MAX >> 1);
        assert_eq!(hdr.req_type(), 42);
        assert_eq!(hdr.msg_size(), 0xAB_CDEF);
        assert_eq!(hdr.dst_sess_id(), 0x1234);
        assert_eq!(hdr.pkt_type(), PktType::Rfr);
        assert_eq!(hdr.pkt_idx(), 0xFFF);
        assert_eq!(hdr.req_idx(), u64::MAX >> 1);
        assert!(hdr.validate());
    }

    #[test]
    fn fields_do_not_bleed() {
        let mut hdr = PacketHeader::default();
        hdr.set_msg_size(MAX_MSG_SIZE as u32);
        hdr.set_pkt_type(PktType::ExplCr);
        assert_eq!(hdr.req_type(), 0);
        assert_eq!(hdr.dst_sess_id(), 0);
        assert_eq!(hdr.pkt_idx(), 0);
        assert_eq!(hdr.req_idx(), 0);
        assert_eq!(hdr.msg_size(), MAX_MSG_SIZE as u32);
        assert_eq!(hdr.pkt_type(), PktType::ExplCr);
    }
}
