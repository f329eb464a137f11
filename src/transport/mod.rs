mod udp;

use std::fmt;
use std::mem;

use serde::{de::DeserializeOwned, Serialize};

use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;

/// Memory region handle type.
pub type LKey = u32;

/// One packet to transmit: a fragment of a message buffer bound for a peer.
pub struct TxItem<Tp: Transport> {
    /// Peer for this packet.
    pub peer: *const Tp::Peer,

    /// Message buffer.
    pub msgbuf: *const MsgBuf,

    /// Index of this packet in the entire message.
    pub pkt_idx: usize,
}

/// Trait for an unreliable, unordered datagram transport.
///
/// Reliability, ordering and flow control are the RPC layer's business; a
/// backend only moves packets. Construction-time failures (no such device,
/// unusable socket) panic; runtime send/recv paths are lossy, never blocking.
///
/// The datapath is monomorphic per instance: the backend is chosen when the
/// [`Rpc`](crate::Rpc) is built and never changes.
pub trait Transport: Sized {
    /// Endpoint information, exchanged over the session-management channel.
    /// Must not contain any data dependent on local resources.
    type Endpoint: Sized + Clone + fmt::Debug + Serialize + DeserializeOwned + 'static;

    /// Peer routing information, used for sending. May reference local
    /// resources (e.g. an address handle).
    type Peer: Sized;

    /// Return the endpoint information representing this instance.
    fn endpoint(&self) -> Self::Endpoint;

    /// Construct a peer from the given endpoint information.
    fn make_peer(&self, ep: Self::Endpoint) -> Self::Peer;

    /// Maximum packet size, header included.
    fn mtu(&self) -> usize;

    /// Bytes to reserve before each packet for backend link headers
    /// (0 for kernel-UDP and RDMA-style backends).
    fn headroom(&self) -> usize;

    /// Largest batch accepted by [`tx_burst`](Self::tx_burst) and returned by
    /// one [`rx_burst`](Self::rx_burst).
    fn max_burst(&self) -> usize;

    /// Maximum application data bytes in one packet.
    #[inline(always)]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - mem::size_of::<PacketHeader>()
    }

    /// Register memory so that it is addressable by the transport. Backends
    /// without registration requirements return an opaque tag.
    ///
    /// # Safety
    ///
    /// The memory region `[buf, buf + len)` must be valid for access.
    unsafe fn register(&mut self, buf: *mut u8, len: usize) -> LKey;

    /// Submit up to [`max_burst`](Self::max_burst) packets for transmission.
    /// May queue internally but does not block. Returns how many items were
    /// accepted; the rest should be resubmitted after the next event-loop
    /// tick.
    ///
    /// # Safety
    ///
    /// Every item must reference a live peer and message buffer, and they
    /// must stay live until the next [`poll_send_completions`](Self::poll_send_completions).
    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) -> usize;

    /// Reclaim resources of transmissions that have finished.
    fn poll_send_completions(&mut self);

    /// Receive a batch of packets. Returns the number received.
    fn rx_burst(&mut self) -> usize;

    /// Return the next received packet.
    fn rx_next(&mut self) -> Option<MsgBuf>;

    /// Return a received packet's buffer to the transport.
    ///
    /// # Safety
    ///
    /// Only buffers returned by [`rx_next`](Self::rx_next) may be released,
    /// each exactly once, and must not be used afterwards.
    unsafe fn rx_release(&mut self, item: MsgBuf);
}

pub use udp::{UdpConfig, UdpTransport};
