use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::ptr::NonNull;
use std::slice;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::transport::{LKey, Transport, TxItem};
use crate::util::{huge_alloc::*, likely, roundup, unlikely};

const CACHELINE_SIZE: usize = 64;

/// Reference UDP backend configuration.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Maximum packet size, header included. Must fit in one datagram.
    pub mtu: usize,
    /// Number of receive units.
    pub rx_ring: usize,
    /// Deferred-transmission queue depth.
    pub tx_queue: usize,
    /// Largest TX/RX batch.
    pub max_burst: usize,
    /// Probability of silently dropping an outgoing packet. For loss tests.
    pub loss_rate: f64,
    /// Seed for the loss-injection generator.
    pub loss_seed: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            mtu: 1472,
            rx_ring: 1 << 10,
            tx_queue: 1 << 8,
            max_burst: 32,
            loss_rate: 0.0,
            loss_seed: 1,
        }
    }
}

/// Received but unreturned packet metadata.
struct RxItem {
    /// Receive unit index.
    idx: u32,

    /// Packet length in bytes, header included.
    len: u16,
}

/// A kernel-UDP datagram transport.
///
/// This is the commodity-socket reference backend: it keeps the hugepage
/// receive-unit ring and burst structure of a kernel-bypass backend, but
/// moves packets with plain sendto/recvfrom. Kernel UDP can drop anywhere, so
/// it doubles as the loss-injection backend for protocol tests.
pub struct UdpTransport {
    sock: UdpSocket,
    local: SocketAddr,
    cfg: UdpConfig,

    /// Receive unit memory.
    rx_region: HugeRegion,
    /// Unit indices ready for reuse.
    rx_free: Vec<u32>,
    /// Received, not yet handed out.
    rx_ready: VecDeque<RxItem>,

    /// Datagrams the socket refused to take; retried on completion polls.
    tx_deferred: VecDeque<(SocketAddr, Vec<u8>)>,
    /// Gather buffer for non-contiguous fragments.
    tx_scratch: Vec<u8>,

    /// Loss injection.
    drop_rng: SmallRng,
}

impl UdpTransport {
    /// Per-unit allocation size, cacheline-aligned.
    #[inline(always)]
    fn rx_unit_size(&self) -> usize {
        roundup(self.cfg.mtu, CACHELINE_SIZE)
    }

    /// Pointer to the start of the `i`-th receive unit.
    #[inline(always)]
    fn rx_unit_ptr(&self, i: u32) -> *mut u8 {
        // SAFETY: unit indices stay inside the mapped region.
        unsafe { self.rx_region.ptr.add(i as usize * self.rx_unit_size()) }
    }

    /// Create a transport bound to the given local address, with defaults.
    ///
    /// # Panics
    ///
    /// Panic if the socket cannot be bound or the receive ring cannot be
    /// allocated.
    pub fn bind(addr: impl ToSocketAddrs) -> Self {
        Self::bind_with(addr, UdpConfig::default())
    }

    /// Create a transport bound to the given local address.
    ///
    /// # Panics
    ///
    /// Same as [`bind`](Self::bind); additionally panic on nonsensical
    /// configuration (MTU smaller than a header, zero-size ring).
    pub fn bind_with(addr: impl ToSocketAddrs, cfg: UdpConfig) -> Self {
        assert!(cfg.mtu > mem::size_of::<PacketHeader>(), "MTU too small");
        assert!(cfg.mtu <= 65_507, "MTU exceeds a UDP datagram");
        assert!(cfg.rx_ring > 0 && cfg.max_burst > 0);

        let sock = UdpSocket::bind(addr).expect("failed to bind datapath socket");
        sock.set_nonblocking(true)
            .expect("failed to make datapath socket non-blocking");
        let local = sock.local_addr().expect("failed to resolve local address");

        let unit = roundup(cfg.mtu, CACHELINE_SIZE);
        let rx_region =
            map_region(cfg.rx_ring * unit).expect("failed to allocate receive-unit ring");
        let rx_free = (0..cfg.rx_ring as u32).rev().collect();

        Self {
            sock,
            local,
            rx_region,
            rx_free,
            rx_ready: VecDeque::with_capacity(cfg.max_burst),
            tx_deferred: VecDeque::new(),
            tx_scratch: vec![0u8; cfg.mtu],
            drop_rng: SmallRng::seed_from_u64(cfg.loss_seed),
            cfg,
        }
    }

    /// Push one assembled datagram towards the wire.
    /// Returns `false` when neither the socket nor the deferral queue can
    /// take it.
    fn push_datagram(&mut self, dst: SocketAddr, pkt: &[u8]) -> bool {
        if unlikely(self.cfg.loss_rate > 0.0) && self.drop_rng.gen::<f64>() < self.cfg.loss_rate {
            // Injected loss: the packet is "on the wire" and never arrives.
            return true;
        }

        if self.tx_deferred.is_empty() {
            match self.sock.send_to(pkt, dst) {
                Ok(_) => return true,
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {}
                Err(e) => {
                    // Unreliable transport: log and count it as lost.
                    log::debug!("UDP transport: send_to failed: {}", e);
                    return true;
                }
            }
        }

        if self.tx_deferred.len() < self.cfg.tx_queue {
            self.tx_deferred.push_back((dst, pkt.to_vec()));
            true
        } else {
            false
        }
    }
}

impl Transport for UdpTransport {
    type Endpoint = SocketAddr;
    type Peer = SocketAddr;

    fn endpoint(&self) -> SocketAddr {
        self.local
    }

    fn make_peer(&self, ep: SocketAddr) -> SocketAddr {
        ep
    }

    #[inline(always)]
    fn mtu(&self) -> usize {
        self.cfg.mtu
    }

    #[inline(always)]
    fn headroom(&self) -> usize {
        0
    }

    #[inline(always)]
    fn max_burst(&self) -> usize {
        self.cfg.max_burst
    }

    unsafe fn register(&mut self, _buf: *mut u8, _len: usize) -> LKey {
        // Kernel UDP addresses any memory; hand back an opaque tag.
        0
    }

    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) -> usize {
        for (i, item) in items.iter().enumerate() {
            let msgbuf = &*item.msgbuf;
            let dst = *item.peer;
            let pkt_size = msgbuf.pkt_size(item.pkt_idx);

            let sent = if likely(item.pkt_idx == 0) {
                // Packet 0 is contiguous: header directly before the payload.
                let pkt = slice::from_raw_parts(msgbuf.pkt_hdr(0) as *const u8, pkt_size);
                self.push_datagram(dst, pkt)
            } else {
                // Later fragments gather (header, payload slice) pairs.
                let hdr_len = mem::size_of::<PacketHeader>();
                let data_off = item.pkt_idx * msgbuf.max_data_per_pkt();
                self.tx_scratch[..hdr_len].copy_from_slice(slice::from_raw_parts(
                    msgbuf.pkt_hdr(item.pkt_idx) as *const u8,
                    hdr_len,
                ));
                self.tx_scratch[hdr_len..pkt_size].copy_from_slice(slice::from_raw_parts(
                    msgbuf.as_ptr().add(data_off),
                    pkt_size - hdr_len,
                ));
                let scratch = mem::take(&mut self.tx_scratch);
                let ok = self.push_datagram(dst, &scratch[..pkt_size]);
                self.tx_scratch = scratch;
                ok
            };

            if unlikely(!sent) {
                return i;
            }
        }
        items.len()
    }

    fn poll_send_completions(&mut self) {
        // Sends complete synchronously; only deferred datagrams linger.
        while let Some((dst, pkt)) = self.tx_deferred.front() {
            match self.sock.send_to(pkt, *dst) {
                Ok(_) => {
                    self.tx_deferred.pop_front();
                }
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("UDP transport: deferred send_to failed: {}", e);
                    self.tx_deferred.pop_front();
                }
            }
        }
    }

    fn rx_burst(&mut self) -> usize {
        let mut n = 0;
        while n < self.cfg.max_burst {
            let Some(idx) = self.rx_free.pop() else {
                log::warn!("UDP transport: receive ring exhausted, deferring poll");
                break;
            };

            // SAFETY: the unit is unused and inside the mapped region.
            let unit =
                unsafe { slice::from_raw_parts_mut(self.rx_unit_ptr(idx), self.cfg.mtu) };
            match self.sock.recv_from(unit) {
                Ok((len, _)) if len >= mem::size_of::<PacketHeader>() && len <= self.cfg.mtu => {
                    self.rx_ready.push_back(RxItem {
                        idx,
                        len: len as u16,
                    });
                    n += 1;
                }
                Ok(_) => {
                    // Runt or oversize datagram: not ours, drop it.
                    self.rx_free.push(idx);
                }
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                    self.rx_free.push(idx);
                    break;
                }
                Err(e) => {
                    // ICMP-induced errors surface here on some platforms.
                    log::debug!("UDP transport: recv_from failed: {}", e);
                    self.rx_free.push(idx);
                }
            }
        }
        n
    }

    #[inline]
    fn rx_next(&mut self) -> Option<MsgBuf> {
        let RxItem { idx, len } = self.rx_ready.pop_front()?;

        // SAFETY: guaranteed not null; the unit holds one whole packet.
        // The unit index travels in the unused lkey so release does not have
        // to divide the pointer back into an index.
        let hdr = unsafe { NonNull::new_unchecked(self.rx_unit_ptr(idx)) };
        let data_len = len as usize - mem::size_of::<PacketHeader>();
        Some(unsafe { MsgBuf::borrowed(hdr, data_len, idx as LKey) })
    }

    unsafe fn rx_release(&mut self, item: MsgBuf) {
        self.rx_free.push(item.lkey());
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::pkthdr::PktType;
    use crate::util::buddy::BuddyAllocator;

    fn loopback(cfg: UdpConfig) -> UdpTransport {
        UdpTransport::bind_with("127.0.0.1:0", cfg)
    }

    #[test]
    fn pingpong_one_packet() {
        let mut a = loopback(UdpConfig::default());
        let mut b = loopback(UdpConfig::default());

        let alloc = BuddyAllocator::new();
        let max_data = a.max_data_per_pkt();
        let buf =
            BuddyAllocator::alloc(&alloc, MsgBuf::buffer_size(11, max_data, 0), &mut a).unwrap();
        let msg = MsgBuf::owned(buf, 11, max_data, 0);
        unsafe {
            msg.as_mut_slice().copy_from_slice(b"hello world");
            ptr::write(msg.pkt_hdr(0), PacketHeader::new(7, 11, 3, PktType::Req, 0, 42));
        }

        let peer = a.make_peer(b.endpoint());
        let items = [TxItem {
            peer: &peer,
            msgbuf: &msg,
            pkt_idx: 0,
        }];
        assert_eq!(unsafe { a.tx_burst(&items) }, 1);

        // Kernel delivery on loopback is fast but not instant.
        let mut got = None;
        for _ in 0..1000 {
            if b.rx_burst() > 0 {
                got = b.rx_next();
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        let got = got.expect("packet not delivered on loopback");

        let hdr = unsafe { &*got.pkt_hdr(0) };
        assert!(hdr.validate());
        assert_eq!(hdr.req_type(), 7);
        assert_eq!(hdr.msg_size(), 11);
        assert_eq!(hdr.dst_sess_id(), 3);
        assert_eq!(hdr.req_idx(), 42);
        assert_eq!(unsafe { got.as_slice() }, b"hello world");
        unsafe { b.rx_release(got) };
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut a = loopback(UdpConfig {
            loss_rate: 1.0,
            ..Default::default()
        });
        let mut b = loopback(UdpConfig::default());

        let alloc = BuddyAllocator::new();
        let max_data = a.max_data_per_pkt();
        let buf =
            BuddyAllocator::alloc(&alloc, MsgBuf::buffer_size(4, max_data, 0), &mut a).unwrap();
        let msg = MsgBuf::owned(buf, 4, max_data, 0);
        unsafe { ptr::write(msg.pkt_hdr(0), PacketHeader::new(0, 4, 0, PktType::Req, 0, 0)) };

        let peer = a.make_peer(b.endpoint());
        for _ in 0..32 {
            let items = [TxItem {
                peer: &peer,
                msgbuf: &msg,
                pkt_idx: 0,
            }];
            assert_eq!(unsafe { a.tx_burst(&items) }, 1);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(b.rx_burst(), 0);
    }
}
