pub(crate) mod timely;
pub(crate) mod wheel;

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::pin::Pin;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use std::{mem, ptr};

use quanta::Instant;
use rmp_serde as rmps;

use self::wheel::{TimerEntry, TimerKind, TimingWheel};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::handler::{HandlerMode, ReqHandle, RespItem};
use crate::msgbuf::MsgBuf;
use crate::nexus::{ConnectRefuseReason, Nexus, SmEvent, SmEventDetails, SmEventRx};
use crate::pkthdr::{PacketHeader, PktType, MAX_MSG_SIZE, MAX_PKT_IDX};
use crate::session::*;
use crate::transport::{Transport, TxItem};
use crate::type_alias::*;
use crate::util::{buddy::BuddyAllocator, likely, slab::SlabAllocator, spsc::Spsc, unlikely};

/// Control-packet ring size. Control buffers are reused round-robin; the
/// pool outlasts anything a single event-loop iteration can keep in flight.
const CTRL_POOL: usize = 256;

/// Completion-ring depth for inline and deferred responses.
const LOCAL_DONE_DEPTH: usize = 1 << 12;

/// Cap on requests parked per session before admission pushes back.
const BACKLOG_CAP: usize = 1 << 12;

/// Session-management connect retry cadence and cap.
const CONNECT_RETRY_US: u64 = 100_000;
const CONNECT_ATTEMPT_CAP: u32 = 50;

/// The outcome of one request, delivered to its continuation.
///
/// Ownership of both buffers returns to the application here; there is no
/// separate release step.
pub struct Completion {
    /// The request buffer, untouched.
    pub req: MsgBuf,
    /// The response buffer, resized to the received response on success.
    pub resp: MsgBuf,
    /// The tag passed to `enqueue_request`.
    pub tag: u64,
    /// `Ok` on a full response; the session error otherwise.
    pub result: Result<()>,
}

/// The application callback invoked when a response is fully received (or
/// the request fails with the session). Always runs on the owning event-loop
/// thread.
pub(crate) type Continuation<Tp> = Box<dyn FnOnce(&Rpc<Tp>, Completion) + Send + 'static>;

/// Per-instance datapath counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DpathStats {
    pub tx_pkts: u64,
    pub rx_pkts: u64,
    /// Request/response data packets transmitted.
    pub tx_data: u64,
    pub tx_cr: u64,
    pub tx_rfr: u64,
    pub rx_cr: u64,
    pub rx_rfr: u64,
    /// Timeout-driven retransmission rounds.
    pub retransmits: u64,
    pub resets: u64,
}

/// Work produced by the receive pass, run after the state borrow ends and in
/// packet poll order.
enum Delivery<Tp: Transport> {
    Handler(ReqHandle),
    Completion(Continuation<Tp>, Completion),
}

/// Interior-mutable state of an [`Rpc`] instance.
struct RpcInterior<Tp: Transport> {
    sessions: Vec<Session<Tp>>,
    tp: Tp,
    allocator: Arc<BuddyAllocator>,

    /// Header-only buffers for CR/RFR packets, reused round-robin.
    #[allow(dead_code)]
    ctrl_slab: SlabAllocator,
    ctrl_bufs: Vec<MsgBuf>,
    ctrl_next: usize,

    wheel: TimingWheel,
    /// Scratch for expired timers, reused across iterations.
    expired: Vec<TimerEntry>,

    /// Packets to hand to the transport before the current borrow ends.
    pending_tx: Vec<TxItem<Tp>>,

    stats: DpathStats,
    /// Pacing round-robin start index.
    rr_cursor: usize,
}

impl<Tp: Transport> RpcInterior<Tp> {
    /// Hand staged packets to the transport. Must run before the borrow that
    /// staged them ends; whatever the transport cannot take is dropped and
    /// left to loss recovery.
    fn flush_pending(&mut self) {
        if likely(self.pending_tx.is_empty()) {
            return;
        }
        let items = mem::take(&mut self.pending_tx);
        let burst = self.tp.max_burst();
        for chunk in items.chunks(burst) {
            // SAFETY: staged items reference live peers and buffers owned by
            // sessions or the control ring, all stable under this borrow.
            let accepted = unsafe { self.tp.tx_burst(chunk) };
            if unlikely(accepted < chunk.len()) {
                log::debug!(
                    "transport refused {} staged packets; dropping",
                    chunk.len() - accepted
                );
                break;
            }
        }
        self.pending_tx = items;
        self.pending_tx.clear();
    }

    /// Arm (or re-arm) a slot's retransmission timer.
    fn arm_rto(&mut self, sess_id: SessId, slot_idx: usize, now_us: u64) {
        let slot = &mut self.sessions[sess_id as usize].slots[slot_idx];
        slot.timer_gen = slot.timer_gen.wrapping_add(1);
        self.wheel.insert(TimerEntry {
            sess_id,
            slot_idx,
            gen: slot.timer_gen,
            kind: TimerKind::Rto,
            expires_at: now_us + slot.rto_us,
        });
    }
}

/// Record of the instance bound to the current thread.
#[derive(Clone, Copy)]
struct BoundRpc {
    id: RpcId,
    /// Type-erased pointer to the instance; non-null only while its event
    /// loop is executing on this thread.
    ptr: *const (),
    type_id: TypeId,
}

thread_local! {
    /// The explicit per-thread instance slot. At most one `Rpc` per thread.
    static BOUND_RPC: Cell<Option<BoundRpc>> = const { Cell::new(None) };
}

/// A per-thread RPC endpoint: one transport, its sessions, its buffer pool,
/// and the event loop that drives them.
///
/// All datapath methods must be called from the thread that created the
/// instance; debug builds enforce this.
pub struct Rpc<Tp: Transport> {
    /// ID of this instance, unique within its Nexus.
    id: RpcId,
    /// Nexus this instance is bound to.
    nexus: Pin<Arc<Nexus>>,

    /// Session-management packet sender; an independent socket, so sends do
    /// not funnel through the Nexus.
    sm_tx: UdpSocket,
    /// Session-management event receiver.
    sm_rx: SmEventRx,

    /// Request hand-off rings, one per background worker.
    to_workers: Vec<Arc<Spsc<ReqHandle>>>,
    /// Completion rings coming back, one per background worker.
    from_workers: Vec<Arc<Spsc<RespItem>>>,
    /// Completion ring for inline and deferred responses on this thread.
    local_done: Arc<Spsc<RespItem>>,
    /// Round-robin cursor over workers.
    next_worker: Cell<usize>,
    /// Handles currently out at workers.
    bg_outstanding: Cell<usize>,

    /// Interior-mutable datapath state.
    state: RefCell<RpcInterior<Tp>>,

    cfg: RpcConfig,
    /// Owning thread, checked on datapath entry.
    thread_id: ThreadId,
    /// Epoch for microsecond timestamps.
    t0: Instant,
}

impl<Tp: Transport + 'static> Rpc<Tp> {
    /// Create a new `Rpc` instance bound to a [`Nexus`], with the given ID
    /// and transport.
    ///
    /// # Panics
    ///
    /// - Panic if the ID is already used in this Nexus.
    /// - Panic if this thread already owns an instance.
    pub fn new(nexus: &Pin<Arc<Nexus>>, id: RpcId, mut tp: Tp, cfg: RpcConfig) -> Self {
        BOUND_RPC.with(|slot| {
            assert!(
                slot.get().is_none(),
                "this thread already owns an Rpc instance"
            );
            slot.set(Some(BoundRpc {
                id,
                ptr: ptr::null(),
                type_id: TypeId::of::<Self>(),
            }));
        });

        // Channel registration first: it panics on a duplicate ID.
        let (sm_rx, to_workers) = nexus.register_rpc(id);
        let from_workers = to_workers
            .iter()
            .map(|_| Arc::new(Spsc::new(LOCAL_DONE_DEPTH)))
            .collect();

        let headroom = tp.headroom();
        assert!(
            headroom + mem::size_of::<PacketHeader>() <= 64,
            "transport headroom too large for the control-packet ring"
        );
        let max_data = tp.max_data_per_pkt();
        let mut ctrl_slab = SlabAllocator::new(64);
        let ctrl_bufs = (0..CTRL_POOL)
            .map(|_| {
                let buf = ctrl_slab
                    .alloc(&mut tp)
                    .expect("failed to allocate control-packet ring");
                MsgBuf::owned(buf, 0, max_data, headroom)
            })
            .collect();

        Self {
            id,
            nexus: nexus.clone(),
            sm_tx: UdpSocket::bind("0.0.0.0:0").expect("failed to bind SM socket"),
            sm_rx,
            to_workers,
            from_workers,
            local_done: Arc::new(Spsc::new(LOCAL_DONE_DEPTH)),
            next_worker: Cell::new(0),
            bg_outstanding: Cell::new(0),
            state: RefCell::new(RpcInterior {
                sessions: Vec::new(),
                tp,
                allocator: BuddyAllocator::new(),
                ctrl_slab,
                ctrl_bufs,
                ctrl_next: 0,
                wheel: TimingWheel::for_rto_tracking(),
                expired: Vec::new(),
                pending_tx: Vec::new(),
                stats: DpathStats::default(),
                rr_cursor: 0,
            }),
            cfg,
            thread_id: thread::current().id(),
            t0: Instant::now(),
        }
    }

    /// Run `f` against the instance bound to the current thread, if one is
    /// executing its event loop right now. This is how handlers and
    /// continuations reach their `Rpc` without capturing it.
    pub fn with_current<R>(f: impl FnOnce(&Self) -> R) -> Option<R> {
        BOUND_RPC.with(|slot| {
            let bound = slot.get()?;
            if bound.ptr.is_null() || bound.type_id != TypeId::of::<Self>() {
                return None;
            }
            // SAFETY: the pointer is published only for the duration of
            // `run_event_loop_once` on this very thread.
            Some(f(unsafe { &*(bound.ptr as *const Self) }))
        })
    }

    /// The ID of the instance bound to the current thread, if any.
    pub fn thread_bound_rpc() -> Option<RpcId> {
        BOUND_RPC.with(|slot| slot.get().map(|b| b.id))
    }
}

// Small accessors and time. No `'static` bound here: `Drop` needs these.
impl<Tp: Transport> Rpc<Tp> {
    /// Return the ID of this instance.
    #[inline(always)]
    pub fn id(&self) -> RpcId {
        self.id
    }

    /// Return the Nexus this instance is bound to.
    #[inline(always)]
    pub fn nexus(&self) -> &Pin<Arc<Nexus>> {
        &self.nexus
    }

    /// Return a snapshot of the datapath counters.
    pub fn stats(&self) -> DpathStats {
        self.state.borrow().stats
    }

    #[inline(always)]
    fn now_us(&self) -> u64 {
        self.t0.elapsed().as_micros() as u64
    }

    #[cfg(not(feature = "skip_safety_checks"))]
    #[inline(always)]
    fn thread_check(&self) {
        #[cold]
        #[inline(never)]
        fn thread_check_fail() -> ! {
            panic!("Rpc must not be used on a different thread than it was created on");
        }

        if thread::current().id() != self.thread_id {
            thread_check_fail()
        }
    }

    #[cfg(feature = "skip_safety_checks")]
    #[inline(always)]
    fn thread_check(&self) {}

    /// Serialize and send a session-management event. Best-effort: the SM
    /// protocol retries, so failures only warn.
    fn sm_send(&self, event: &SmEvent, uri: SocketAddr) {
        let msg = rmps::to_vec(event).expect("failed to serialize SM event");
        if let Err(e) = self.sm_tx.send_to(&msg, uri) {
            log::warn!("RPC {}: failed to send SM event to {}: {}", self.id, uri, e);
        }
    }

    fn send_connect_request(&self, tp: &Tp, sess_id: SessId, sess: &Session<Tp>) {
        let cli_ep = rmps::to_vec(&tp.endpoint()).expect("failed to serialize local endpoint");
        let event = SmEvent {
            src_rpc_id: self.id,
            dst_rpc_id: sess.peer_rpc_id,
            src_uri: self.nexus.uri(),
            details: SmEventDetails::ConnectRequest {
                cli_ep,
                cli_sess_id: sess_id,
                handler_hash: self.nexus.handler_hash(),
            },
        };
        self.sm_send(&event, sess.peer_uri);
    }
}

// Buffer management API.
impl<Tp: Transport + 'static> Rpc<Tp> {
    /// Allocate a message buffer that can hold `len` bytes of application
    /// data, with its packet headers interleaved. Contents start
    /// uninitialized and the length starts at `len`.
    pub fn alloc_msg_buffer(&self, len: usize) -> Result<MsgBuf> {
        self.thread_check();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        let max_data = state.tp.max_data_per_pkt();
        if unlikely(len > MAX_MSG_SIZE || MsgBuf::pkts_for(len, max_data) > MAX_PKT_IDX as usize + 1)
        {
            return Err(Error::TooLarge);
        }

        let headroom = state.tp.headroom();
        let buf = BuddyAllocator::alloc(
            &state.allocator,
            MsgBuf::buffer_size(len, max_data, headroom),
            &mut state.tp,
        )?;
        Ok(MsgBuf::owned(buf, len, max_data, headroom))
    }

    /// Return a message buffer to the pool.
    ///
    /// Dropping the buffer has the same effect; this spelling exists for
    /// symmetry with [`alloc_msg_buffer`](Self::alloc_msg_buffer).
    pub fn free_msg_buffer(&self, buf: MsgBuf) {
        self.thread_check();
        drop(buf);
    }

    /// Shrink or re-grow a buffer within its original capacity, without
    /// reallocation.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuf, new_len: usize) -> Result<()> {
        if new_len > buf.capacity() {
            return Err(Error::TooLarge);
        }
        buf.set_len(new_len);
        Ok(())
    }
}

// Session lifecycle API.
impl<Tp: Transport + 'static> Rpc<Tp> {
    /// Create a client session towards `remote_rpc_id` at the remote Nexus
    /// URI. Returns immediately; connection establishment proceeds in the
    /// event loop. Poll [`is_connected`](Self::is_connected).
    pub fn create_session(
        &self,
        remote_uri: impl ToSocketAddrs,
        remote_rpc_id: RpcId,
    ) -> Result<SessId> {
        self.thread_check();
        let uri = remote_uri
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(Error::InvalidSession)?;

        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        if state.sessions.len() >= self.cfg.max_sessions {
            return Err(Error::TooManySessions);
        }

        let sess_id = state.sessions.len() as SessId;
        let sess = Session::new(
            SessionRole::Client,
            SessionState::Connecting,
            uri,
            remote_rpc_id,
            &self.cfg,
        );
        self.send_connect_request(&state.tp, sess_id, &sess);
        state.sessions.push(sess);

        state.wheel.insert(TimerEntry {
            sess_id,
            slot_idx: 0,
            gen: 0,
            kind: TimerKind::ConnectRetry,
            expires_at: self.now_us() + CONNECT_RETRY_US,
        });
        Ok(sess_id)
    }

    /// Tear a session down. In-flight requests fail with
    /// [`Error::SessionReset`] right away; the peer is asked to release its
    /// end, and the session is unusable from this point on.
    pub fn destroy_session(&self, sess_id: SessId) -> Result<()> {
        self.thread_check();
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            let sess = state
                .sessions
                .get_mut(sess_id as usize)
                .ok_or(Error::InvalidSession)?;
            if !matches!(sess.state, SessionState::Connecting | SessionState::Connected) {
                return Err(Error::Disconnected);
            }

            Self::fail_inflight(sess, Error::SessionReset, &mut deliveries);
            sess.state = SessionState::Disconnecting;
            let event = SmEvent {
                src_rpc_id: self.id,
                dst_rpc_id: sess.peer_rpc_id,
                src_uri: self.nexus.uri(),
                details: SmEventDetails::Disconnect {
                    dst_sess_id: sess.peer_sess_id,
                    src_sess_id: sess_id,
                },
            };
            let uri = sess.peer_uri;
            self.sm_send(&event, uri);
        }
        self.run_deliveries(deliveries);
        Ok(())
    }

    /// Return `true` if the session is connected and usable.
    pub fn is_connected(&self, sess_id: SessId) -> bool {
        self.state
            .borrow()
            .sessions
            .get(sess_id as usize)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }
}

// Datapath API.
impl<Tp: Transport + 'static> Rpc<Tp> {
    /// Enqueue a request on a session.
    ///
    /// Both buffers move into the engine and come back through the
    /// continuation's [`Completion`], exactly once: with `Ok` once the full
    /// response is in `resp` (truncated with a warning if it outgrows the
    /// buffer), or with the session error if the session dies first.
    ///
    /// The request is admitted to the wire by the event loop, subject to the
    /// session's window, credits, and pacing.
    pub fn enqueue_request<F>(
        &self,
        sess_id: SessId,
        req_type: ReqType,
        req: MsgBuf,
        resp: MsgBuf,
        cont: F,
        tag: u64,
    ) -> Result<()>
    where
        F: FnOnce(&Rpc<Tp>, Completion) + Send + 'static,
    {
        self.thread_check();
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        if unlikely(req.len() > MAX_MSG_SIZE || req.n_pkts() > MAX_PKT_IDX as usize + 1) {
            return Err(Error::TooLarge);
        }

        let sess = state
            .sessions
            .get_mut(sess_id as usize)
            .ok_or(Error::InvalidSession)?;
        if !sess.is_client() {
            return Err(Error::InvalidSession);
        }
        match sess.state {
            SessionState::Connecting | SessionState::Connected => {}
            _ => return Err(Error::Disconnected),
        }
        if unlikely(sess.backlog.len() >= BACKLOG_CAP) {
            return Err(Error::RingExhausted);
        }

        sess.backlog.push_back(PendingRequest {
            req_type,
            req,
            resp,
            cont: Box::new(cont),
            tag,
        });
        Ok(())
    }

    /// Enqueue a handler's response for transmission. Equivalent to
    /// [`ReqHandle::respond()`], for code that holds the handle on the
    /// event-loop thread (e.g. nested-RPC continuations).
    pub fn enqueue_response(&self, handle: ReqHandle) {
        self.thread_check();
        handle.respond();
    }

    /// Run one iteration of the event loop: poll the transport, advance
    /// timers, drain completions, process one session-management event, and
    /// admit packets under credits and pacing.
    pub fn run_event_loop_once(&self) {
        self.thread_check();
        BOUND_RPC.with(|slot| {
            if let Some(mut bound) = slot.get() {
                bound.ptr = self as *const Self as *const ();
                slot.set(Some(bound));
            }
        });

        self.process_rx();
        {
            if let Ok(mut state) = self.state.try_borrow_mut() {
                state.tp.poll_send_completions();
            }
        }
        self.process_timers();
        self.process_completions();
        if unlikely(!self.sm_rx.is_empty()) {
            self.process_sm_event();
        }
        self.process_tx();

        BOUND_RPC.with(|slot| {
            if let Some(mut bound) = slot.get() {
                bound.ptr = ptr::null();
                slot.set(Some(bound));
            }
        });
    }

    /// Run the event loop until (at least) `ms` milliseconds have passed.
    /// The deadline is advisory: the loop returns once the iteration running
    /// at expiry finishes.
    pub fn run_event_loop(&self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            self.run_event_loop_once();
            if Instant::now() >= deadline {
                break;
            }
        }
    }
}

// Receive path.
impl<Tp: Transport + 'static> Rpc<Tp> {
    fn process_rx(&self) {
        let mut deliveries: Vec<Delivery<Tp>> = Vec::new();
        {
            // Abort if progressing recursively.
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            let state: &mut RpcInterior<Tp> = &mut state;

            let now = self.now_us();
            let n = state.tp.rx_burst();
            for _ in 0..n {
                let Some(item) = state.tp.rx_next() else { break };
                state.stats.rx_pkts += 1;

                // SAFETY: the transport put a header right before the data.
                let hdr = unsafe { ptr::read(item.pkt_hdr(0) as *const PacketHeader) };
                if unlikely(!hdr.validate()) {
                    log::warn!("RPC {}: dropping malformed packet", self.id);
                } else if unlikely(hdr.dst_sess_id() as usize >= state.sessions.len()) {
                    log::warn!(
                        "RPC {}: dropping packet for non-existent session {}",
                        self.id,
                        hdr.dst_sess_id()
                    );
                } else {
                    match hdr.pkt_type() {
                        PktType::Req => self.rx_req_pkt(state, &hdr, &item, &mut deliveries),
                        PktType::Resp => {
                            self.rx_resp_pkt(state, &hdr, &item, now, &mut deliveries)
                        }
                        PktType::Rfr => {
                            state.stats.rx_rfr += 1;
                            self.rx_rfr_pkt(state, &hdr);
                        }
                        PktType::ExplCr => {
                            state.stats.rx_cr += 1;
                            self.rx_cr_pkt(state, &hdr, now);
                        }
                    }
                }

                // SAFETY: fresh from `rx_next`, released exactly once.
                unsafe { state.tp.rx_release(item) };
            }
            state.flush_pending();
        }
        self.run_deliveries(deliveries);
    }

    /// A request data packet arrived (server side).
    fn rx_req_pkt(
        &self,
        state: &mut RpcInterior<Tp>,
        hdr: &PacketHeader,
        payload: &MsgBuf,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        let RpcInterior {
            sessions,
            tp,
            allocator,
            ctrl_bufs,
            ctrl_next,
            stats,
            pending_tx,
            ..
        } = state;

        let sess_id = hdr.dst_sess_id();
        let sess = &mut sessions[sess_id as usize];
        if unlikely(sess.role != SessionRole::Server || !sess.is_connected()) {
            log::warn!(
                "RPC {}: dropping request packet for non-serving session {}",
                self.id,
                sess_id
            );
            return;
        }

        let max_data = tp.max_data_per_pkt();
        let msg_size = hdr.msg_size() as usize;
        let total = MsgBuf::pkts_for(msg_size, max_data);
        let pkt_idx = hdr.pkt_idx() as usize;
        let req_num = hdr.req_idx();
        if unlikely(pkt_idx >= total || msg_size > MAX_MSG_SIZE) {
            log::warn!("RPC {}: dropping request packet with bad geometry", self.id);
            return;
        }

        let window = sess.slots.len();
        let slot_idx = (req_num % window as ReqIdx) as usize;
        let peer = sess.peer.as_ref().unwrap() as *const Tp::Peer;
        let peer_sess_id = sess.peer_sess_id;
        let slot = &mut sess.slots[slot_idx];

        // Classify against the slot's current request.
        let start_new = match &mut slot.ctl {
            SlotCtl::Server(ctl) => {
                if req_num < slot.req_num {
                    return; // packet of a long-gone request
                }
                if req_num == slot.req_num {
                    if ctl.req_seen[pkt_idx] {
                        // Duplicate. A duplicate first packet doubles as a
                        // lost-CR / lost-response probe.
                        if pkt_idx == 0 {
                            if let Some(resp) = &ctl.resp {
                                let resp_ptr = resp as *const MsgBuf;
                                stats.tx_pkts += 1;
                                stats.tx_data += 1;
                                pending_tx.push(TxItem {
                                    peer,
                                    msgbuf: resp_ptr,
                                    pkt_idx: 0,
                                });
                            } else if total > 1 && ctl.cr_sent && ctl.req_rcvd < ctl.req_total {
                                let buf = &ctrl_bufs[*ctrl_next];
                                *ctrl_next = (*ctrl_next + 1) % ctrl_bufs.len();
                                // SAFETY: control buffers are ours alone.
                                unsafe {
                                    ptr::write(
                                        buf.pkt_hdr(0),
                                        PacketHeader::new(
                                            hdr.req_type(),
                                            0,
                                            peer_sess_id,
                                            PktType::ExplCr,
                                            0,
                                            req_num,
                                        ),
                                    );
                                }
                                stats.tx_pkts += 1;
                                stats.tx_cr += 1;
                                pending_tx.push(TxItem {
                                    peer,
                                    msgbuf: buf,
                                    pkt_idx: 0,
                                });
                            }
                        }
                        return;
                    }
                    false
                } else {
                    true // the slot moves on to a newer request
                }
            }
            SlotCtl::Vacant => true,
            SlotCtl::Client(_) => {
                log::warn!(
                    "RPC {}: request packet addressed a client slot on session {}",
                    self.id,
                    sess_id
                );
                return;
            }
        };

        if start_new {
            let headroom = tp.headroom();
            let buf = match BuddyAllocator::alloc(
                allocator,
                MsgBuf::buffer_size(msg_size, max_data, headroom),
                tp,
            ) {
                Ok(buf) => buf,
                Err(e) => {
                    log::error!(
                        "RPC {}: cannot stage {}B request: {}; dropping packet",
                        self.id,
                        msg_size,
                        e
                    );
                    return;
                }
            };
            slot.req_num = req_num;
            slot.req_type = hdr.req_type();
            slot.state = SlotState::InProgress;
            slot.ctl = SlotCtl::Server(ServerCtl::new(
                MsgBuf::owned(buf, msg_size, max_data, headroom),
                total,
            ));
        }

        let req_type = slot.req_type;
        let ctl = slot.server_ctl().unwrap();

        // Place the fragment at its numbered offset.
        let offset = pkt_idx * max_data;
        let frag_len = max_data.min(msg_size - offset);
        if unlikely(payload.len() != frag_len) {
            log::warn!("RPC {}: dropping request fragment with bad length", self.id);
            return;
        }
        let req = ctl.req.as_mut().unwrap();
        // SAFETY: both sides are live buffers; the offset is in bounds.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), req.as_ptr().add(offset), frag_len) };
        ctl.req_seen.set(pkt_idx, true);
        ctl.req_rcvd += 1;

        // One credit return grants the rest of a multi-packet request.
        if pkt_idx == 0 && total > 1 && !ctl.cr_sent {
            ctl.cr_sent = true;
            let buf = &ctrl_bufs[*ctrl_next];
            *ctrl_next = (*ctrl_next + 1) % ctrl_bufs.len();
            // SAFETY: control buffers are ours alone.
            unsafe {
                ptr::write(
                    buf.pkt_hdr(0),
                    PacketHeader::new(req_type, 0, peer_sess_id, PktType::ExplCr, 0, req_num),
                );
            }
            stats.tx_pkts += 1;
            stats.tx_cr += 1;
            pending_tx.push(TxItem {
                peer,
                msgbuf: buf,
                pkt_idx: 0,
            });
        }

        if ctl.req_rcvd < ctl.req_total {
            return;
        }

        // Fully reassembled: hand it to the handler.
        let Some(desc) = self.nexus.handlers().get(req_type) else {
            log::warn!(
                "RPC {}: received request for unknown request type {}",
                self.id,
                req_type
            );
            slot.ctl = SlotCtl::Vacant;
            slot.state = SlotState::Idle;
            return;
        };

        let req = ctl.req.take().unwrap();
        let headroom = tp.headroom();
        let resp = match BuddyAllocator::alloc(
            allocator,
            MsgBuf::buffer_size(max_data, max_data, headroom),
            tp,
        ) {
            Ok(buf) => MsgBuf::owned(buf, max_data, max_data, headroom),
            Err(e) => {
                log::error!("RPC {}: cannot stage response buffer: {}", self.id, e);
                ctl.req = Some(req);
                return;
            }
        };
        let item = RespItem {
            sess_id,
            slot_idx,
            req_num,
            req_type,
            req,
            resp,
            dyn_resp: None,
            responded: false,
        };

        match desc.mode {
            HandlerMode::Inline => {
                deliveries.push(Delivery::Handler(ReqHandle::new(item, self.local_done.clone())));
            }
            HandlerMode::Background => {
                if self.to_workers.is_empty() {
                    log::warn!(
                        "RPC {}: no background workers; running handler inline",
                        self.id
                    );
                    deliveries
                        .push(Delivery::Handler(ReqHandle::new(item, self.local_done.clone())));
                } else {
                    let w = self.next_worker.get() % self.to_workers.len();
                    self.next_worker.set(self.next_worker.get().wrapping_add(1));
                    let handle = ReqHandle::new(item, self.from_workers[w].clone());
                    self.bg_outstanding.set(self.bg_outstanding.get() + 1);
                    if let Err(handle) = self.to_workers[w].push(handle) {
                        log::warn!(
                            "RPC {}: worker ring full; running handler inline",
                            self.id
                        );
                        deliveries.push(Delivery::Handler(handle));
                    }
                }
            }
        }
    }

    /// A response data packet arrived (client side).
    fn rx_resp_pkt(
        &self,
        state: &mut RpcInterior<Tp>,
        hdr: &PacketHeader,
        payload: &MsgBuf,
        now: u64,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        let RpcInterior {
            sessions,
            tp,
            wheel,
            ..
        } = state;

        let sess_id = hdr.dst_sess_id();
        let sess = &mut sessions[sess_id as usize];
        if unlikely(!sess.is_client() || !sess.is_connected()) {
            return;
        }

        let window = sess.slots.len();
        let req_num = hdr.req_idx();
        let slot_idx = (req_num % window as ReqIdx) as usize;
        let slot = &mut sess.slots[slot_idx];
        if slot.is_idle() || slot.req_num != req_num {
            return; // response of a completed or reset request
        }
        let retries = slot.retries;
        let tx_ts = slot.tx_ts_us;
        let Some(ctl) = slot.client_ctl() else { return };

        let max_data = tp.max_data_per_pkt();
        let pkt_idx = hdr.pkt_idx() as usize;
        let msg_size = hdr.msg_size() as usize;

        if ctl.resp_total.is_none() {
            // First response packet: the response geometry is now known, and
            // every request packet is implicitly acknowledged.
            let total = MsgBuf::pkts_for(msg_size, max_data);
            ctl.resp_total = Some(total);
            ctl.resp_msg_size = msg_size;
            ctl.resp_seen = bitvec::vec::BitVec::repeat(false, total);
            if unlikely(msg_size > ctl.resp.capacity()) {
                log::warn!(
                    "RPC {}: truncating {}B response to {}B buffer on session {}",
                    self.id,
                    msg_size,
                    ctl.resp.capacity(),
                    sess_id
                );
            }
            if !ctl.cr_seen {
                sess.credits += 1;
                if retries == 0 {
                    sess.observe_rtt(now.saturating_sub(tx_ts), &self.cfg);
                }
            }
        }

        // Re-borrow after the credit/RTT updates above released `sess`.
        let sess = &mut sessions[sess_id as usize];
        let slot = &mut sess.slots[slot_idx];
        let ctl = slot.client_ctl().unwrap();
        let total = ctl.resp_total.unwrap();
        if unlikely(pkt_idx >= total) || ctl.resp_seen[pkt_idx] {
            return; // duplicate; idempotent reassembly drops it
        }

        if pkt_idx > 0 {
            sess.credits += 1;
        }
        let sess = &mut sessions[sess_id as usize];
        let slot = &mut sess.slots[slot_idx];
        let ctl = slot.client_ctl().unwrap();

        // Out-of-order segments land at their numbered offsets; anything
        // beyond the caller's buffer is clipped.
        let offset = pkt_idx * max_data;
        if offset < ctl.resp.capacity() {
            let frag_len = payload.len().min(ctl.resp.capacity() - offset);
            // SAFETY: both sides live, offsets in bounds.
            unsafe {
                ptr::copy_nonoverlapping(payload.as_ptr(), ctl.resp.as_ptr().add(offset), frag_len)
            };
        }
        ctl.resp_seen.set(pkt_idx, true);
        ctl.resp_rcvd += 1;
        while ctl.resp_next < total && ctl.resp_seen[ctl.resp_next] {
            ctl.resp_next += 1;
        }

        if ctl.resp_rcvd == total {
            // Complete: free the slot before the continuation runs, so it can
            // immediately reuse the window.
            let SlotCtl::Client(ctl) = mem::replace(&mut slot.ctl, SlotCtl::Vacant) else {
                unreachable!()
            };
            slot.state = SlotState::Idle;
            slot.retries = 0;
            slot.timer_gen = slot.timer_gen.wrapping_add(1); // disarm
            let ClientCtl {
                req,
                mut resp,
                cont,
                tag,
                resp_msg_size,
                ..
            } = *ctl;
            resp.set_len(resp_msg_size.min(resp.capacity()));
            deliveries.push(Delivery::Completion(
                cont.unwrap(),
                Completion {
                    req,
                    resp,
                    tag,
                    result: Ok(()),
                },
            ));
        } else {
            // Pull the next missing segment, once per segment; timeouts
            // re-pull for free.
            let next = ctl.resp_next;
            if next < total && next > ctl.rfr_hwm {
                ctl.rfr_hwm = next;
                sess.tx_q.push_back(QueuedPkt {
                    slot_idx,
                    req_num,
                    pkt_idx: next as PktIdx,
                    kind: QueuedKind::Rfr,
                    retrans: false,
                });
            }
            // Progress happened: push the retransmission deadline out.
            let slot = &mut sess.slots[slot_idx];
            slot.timer_gen = slot.timer_gen.wrapping_add(1);
            wheel.insert(TimerEntry {
                sess_id,
                slot_idx,
                gen: slot.timer_gen,
                kind: TimerKind::Rto,
                expires_at: now + slot.rto_us,
            });
        }
    }

    /// A request-for-response arrived (server side): re-send one response
    /// segment.
    fn rx_rfr_pkt(&self, state: &mut RpcInterior<Tp>, hdr: &PacketHeader) {
        let RpcInterior {
            sessions,
            stats,
            pending_tx,
            ..
        } = state;

        let sess = &mut sessions[hdr.dst_sess_id() as usize];
        if unlikely(sess.role != SessionRole::Server || !sess.is_connected()) {
            return;
        }
        let peer = sess.peer.as_ref().unwrap() as *const Tp::Peer;
        let window = sess.slots.len();
        let req_num = hdr.req_idx();
        let slot = &mut sess.slots[(req_num % window as ReqIdx) as usize];
        if slot.req_num != req_num {
            return;
        }
        let Some(ctl) = slot.server_ctl() else { return };
        let Some(resp) = &ctl.resp else {
            return; // the handler is still working; the client will re-pull
        };

        let pkt_idx = hdr.pkt_idx() as usize;
        if unlikely(pkt_idx >= resp.n_pkts()) {
            return;
        }
        stats.tx_pkts += 1;
        stats.tx_data += 1;
        pending_tx.push(TxItem {
            peer,
            msgbuf: resp as *const MsgBuf,
            pkt_idx,
        });
    }

    /// An explicit credit return arrived (client side): the first packet of
    /// a multi-packet request landed, and the rest may flow.
    fn rx_cr_pkt(&self, state: &mut RpcInterior<Tp>, hdr: &PacketHeader, now: u64) {
        let RpcInterior {
            sessions, wheel, ..
        } = state;

        let sess_id = hdr.dst_sess_id();
        let sess = &mut sessions[sess_id as usize];
        if unlikely(!sess.is_client() || !sess.is_connected()) {
            return;
        }
        let window = sess.slots.len();
        let req_num = hdr.req_idx();
        let slot_idx = (req_num % window as ReqIdx) as usize;
        let slot = &mut sess.slots[slot_idx];
        if slot.is_idle() || slot.req_num != req_num {
            return;
        }
        let retries = slot.retries;
        let tx_ts = slot.tx_ts_us;
        let Some(ctl) = slot.client_ctl() else { return };
        if ctl.cr_seen {
            return;
        }

        ctl.cr_seen = true;
        let first_unsent = ctl.req_sent;
        let total = ctl.req_total;
        for pkt_idx in first_unsent..total {
            sess.tx_q.push_back(QueuedPkt {
                slot_idx,
                req_num,
                pkt_idx: pkt_idx as PktIdx,
                kind: QueuedKind::ReqData,
                retrans: false,
            });
        }
        sess.credits += 1;
        if retries == 0 {
            sess.observe_rtt(now.saturating_sub(tx_ts), &self.cfg);
        }

        let slot = &mut sess.slots[slot_idx];
        slot.timer_gen = slot.timer_gen.wrapping_add(1);
        wheel.insert(TimerEntry {
            sess_id,
            slot_idx,
            gen: slot.timer_gen,
            kind: TimerKind::Rto,
            expires_at: now + slot.rto_us,
        });
    }
}

// Timers, completions, session management.
impl<Tp: Transport + 'static> Rpc<Tp> {
    fn process_timers(&self) {
        let mut deliveries = Vec::new();
        {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            let state: &mut RpcInterior<Tp> = &mut state;
            let now = self.now_us();

            let mut expired = mem::take(&mut state.expired);
            expired.clear();
            state.wheel.advance_into(now, &mut expired);

            for entry in &expired {
                if entry.sess_id as usize >= state.sessions.len() {
                    continue;
                }
                match entry.kind {
                    TimerKind::ConnectRetry => self.on_connect_retry(state, entry.sess_id, now, &mut deliveries),
                    TimerKind::Rto => self.on_rto(state, entry, now, &mut deliveries),
                }
            }
            state.expired = expired;
            state.flush_pending();
        }
        self.run_deliveries(deliveries);
    }

    fn on_connect_retry(
        &self,
        state: &mut RpcInterior<Tp>,
        sess_id: SessId,
        now: u64,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        let sess = &mut state.sessions[sess_id as usize];
        if sess.state != SessionState::Connecting {
            return;
        }
        sess.connect_attempts += 1;
        if sess.connect_attempts > CONNECT_ATTEMPT_CAP {
            log::warn!(
                "RPC {}: giving up connecting session {} after {} attempts",
                self.id,
                sess_id,
                sess.connect_attempts
            );
            self.reset_session(state, sess_id, Error::SessionReset, false, deliveries);
            return;
        }
        self.send_connect_request(&state.tp, sess_id, &state.sessions[sess_id as usize]);
        state.wheel.insert(TimerEntry {
            sess_id,
            slot_idx: 0,
            gen: 0,
            kind: TimerKind::ConnectRetry,
            expires_at: now + CONNECT_RETRY_US,
        });
    }

    fn on_rto(
        &self,
        state: &mut RpcInterior<Tp>,
        entry: &TimerEntry,
        now: u64,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        enum Recovery {
            /// Retransmit request packets in `[from, to)`.
            GoBack(usize, usize),
            /// Pull response segment `.0` again.
            Pull(PktIdx),
        }

        {
            let sess = &mut state.sessions[entry.sess_id as usize];
            if !sess.is_connected() {
                return;
            }
            let base_rto = sess.base_rto_us(&self.cfg);
            let slot = &mut sess.slots[entry.slot_idx];
            if slot.timer_gen != entry.gen || slot.is_idle() {
                return; // stale: the slot made progress or completed
            }

            slot.retries += 1;
            if slot.retries > self.cfg.max_retransmits {
                // The retransmission cap is the peer-death detector.
                log::warn!(
                    "RPC {}: request {} on session {} exceeded {} retransmissions; resetting session",
                    self.id,
                    slot.req_num,
                    entry.sess_id,
                    self.cfg.max_retransmits
                );
                self.reset_session(state, entry.sess_id, Error::SessionReset, true, deliveries);
                return;
            }

            slot.rto_us = (slot.rto_us * 2).min(base_rto * 8);
            let req_num = slot.req_num;
            let Some(ctl) = slot.client_ctl() else {
                return;
            };

            let recovery = if ctl.resp_rcvd > 0 {
                // The response stalled: pull the lowest missing segment again.
                Recovery::Pull(ctl.resp_next as PktIdx)
            } else {
                // No response byte seen: go back and re-send everything that
                // went out. Duplicates are filtered remotely, the first
                // packet doubles as a probe that makes the server repeat its
                // credit return or its response.
                Recovery::GoBack(0, ctl.req_sent)
            };

            match recovery {
                Recovery::GoBack(from, to) => {
                    for pkt_idx in from..to {
                        sess.tx_q.push_back(QueuedPkt {
                            slot_idx: entry.slot_idx,
                            req_num,
                            pkt_idx: pkt_idx as PktIdx,
                            kind: QueuedKind::ReqData,
                            retrans: true,
                        });
                    }
                }
                Recovery::Pull(next) => {
                    sess.tx_q.push_back(QueuedPkt {
                        slot_idx: entry.slot_idx,
                        req_num,
                        pkt_idx: next,
                        kind: QueuedKind::Rfr,
                        retrans: true,
                    });
                }
            }
        }

        state.stats.retransmits += 1;
        state.arm_rto(entry.sess_id, entry.slot_idx, now);
    }

    /// Drain handler completions (step 5): inline/deferred responses from
    /// this thread and finished handles from the workers.
    fn process_completions(&self) {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior<Tp> = &mut state;

        while let Some(item) = self.local_done.pop() {
            self.finish_response(state, item);
        }
        for ring in &self.from_workers {
            while let Some(item) = ring.pop() {
                self.bg_outstanding
                    .set(self.bg_outstanding.get().saturating_sub(1));
                self.finish_response(state, item);
            }
        }
    }

    fn finish_response(&self, state: &mut RpcInterior<Tp>, item: RespItem) {
        let RpcInterior { sessions, .. } = state;

        let Some(sess) = sessions.get_mut(item.sess_id as usize) else {
            return;
        };
        if !sess.is_connected() {
            return; // session died while the handler ran; buffers just free
        }
        let peer_sess_id = sess.peer_sess_id;
        let slot = &mut sess.slots[item.slot_idx];
        if slot.req_num != item.req_num || slot.server_ctl().is_none() {
            return; // the slot moved on
        }

        if !item.responded {
            log::warn!(
                "RPC {}: handler dropped request {} on session {} without responding",
                self.id,
                item.req_num,
                item.sess_id
            );
            slot.ctl = SlotCtl::Vacant;
            slot.state = SlotState::Idle;
            return;
        }

        let resp = item.dyn_resp.unwrap_or(item.resp);
        let total = resp.n_pkts();
        if unlikely(resp.len() > MAX_MSG_SIZE || total > MAX_PKT_IDX as usize + 1) {
            log::error!(
                "RPC {}: response for request {} is too large for the wire; dropping",
                self.id,
                item.req_num
            );
            slot.ctl = SlotCtl::Vacant;
            slot.state = SlotState::Idle;
            return;
        }

        for pkt_idx in 0..total {
            // SAFETY: headers interleave inside the response buffer.
            unsafe {
                ptr::write(
                    resp.pkt_hdr(pkt_idx),
                    PacketHeader::new(
                        item.req_type,
                        resp.len() as u32,
                        peer_sess_id,
                        PktType::Resp,
                        pkt_idx as PktIdx,
                        item.req_num,
                    ),
                );
            }
        }

        let ctl = slot.server_ctl().unwrap();
        ctl.resp = Some(resp);
        slot.state = SlotState::Idle;

        // Segment 0 goes out eagerly; the client pulls the rest.
        sess.tx_q.push_back(QueuedPkt {
            slot_idx: item.slot_idx,
            req_num: item.req_num,
            pkt_idx: 0,
            kind: QueuedKind::RespData,
            retrans: false,
        });
    }

    /// Process at most one session-management event (step 6).
    fn process_sm_event(&self) {
        let Some(event) = self.sm_rx.recv() else { return };
        log::trace!("RPC {}: received SM event {:?}", self.id, event);
        debug_assert_eq!(event.dst_rpc_id, self.id, "bad SM event dispatch");

        let mut deliveries = Vec::new();
        {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            let state: &mut RpcInterior<Tp> = &mut state;

            match event.details {
                SmEventDetails::ConnectRequest {
                    cli_ep,
                    cli_sess_id,
                    handler_hash,
                } => self.on_connect_request(
                    state,
                    event.src_rpc_id,
                    event.src_uri,
                    cli_ep,
                    cli_sess_id,
                    handler_hash,
                ),
                SmEventDetails::ConnectAcknowledge {
                    cli_sess_id,
                    svr_ep,
                    svr_sess_id,
                } => self.on_connect_ack(state, cli_sess_id, svr_ep, svr_sess_id),
                SmEventDetails::ConnectRefuse {
                    cli_sess_id,
                    reason,
                } => {
                    if (cli_sess_id as usize) < state.sessions.len()
                        && state.sessions[cli_sess_id as usize].state == SessionState::Connecting
                    {
                        log::warn!(
                            "RPC {}: session {} refused by remote peer: {}",
                            self.id,
                            cli_sess_id,
                            reason
                        );
                        self.reset_session(
                            state,
                            cli_sess_id,
                            Error::InvalidRemoteRpcId,
                            false,
                            &mut deliveries,
                        );
                    }
                }
                SmEventDetails::Disconnect {
                    dst_sess_id,
                    src_sess_id,
                } => {
                    if (dst_sess_id as usize) < state.sessions.len() {
                        self.reset_session(
                            state,
                            dst_sess_id,
                            Error::SessionReset,
                            false,
                            &mut deliveries,
                        );
                        state.sessions[dst_sess_id as usize].state = SessionState::Disconnected;
                        let ack = SmEvent {
                            src_rpc_id: self.id,
                            dst_rpc_id: event.src_rpc_id,
                            src_uri: self.nexus.uri(),
                            details: SmEventDetails::DisconnectAck {
                                dst_sess_id: src_sess_id,
                            },
                        };
                        self.sm_send(&ack, event.src_uri);
                    }
                }
                SmEventDetails::DisconnectAck { dst_sess_id } => {
                    if let Some(sess) = state.sessions.get_mut(dst_sess_id as usize) {
                        if sess.state == SessionState::Disconnecting {
                            sess.state = SessionState::Disconnected;
                        }
                    }
                }
                SmEventDetails::Reset { dst_sess_id } => {
                    if (dst_sess_id as usize) < state.sessions.len() {
                        self.reset_session(
                            state,
                            dst_sess_id,
                            Error::SessionReset,
                            false,
                            &mut deliveries,
                        );
                    }
                }
            }
        }
        self.run_deliveries(deliveries);
    }

    fn on_connect_request(
        &self,
        state: &mut RpcInterior<Tp>,
        src_rpc_id: RpcId,
        src_uri: SocketAddr,
        cli_ep: Vec<u8>,
        cli_sess_id: SessId,
        handler_hash: u64,
    ) {
        let refuse = |reason: ConnectRefuseReason| SmEvent {
            src_rpc_id: self.id,
            dst_rpc_id: src_rpc_id,
            src_uri: self.nexus.uri(),
            details: SmEventDetails::ConnectRefuse {
                cli_sess_id,
                reason,
            },
        };

        // A retried request for a session we already accepted: re-ack.
        for (i, sess) in state.sessions.iter().enumerate() {
            if sess.role == SessionRole::Server
                && sess.peer_rpc_id == src_rpc_id
                && sess.peer_sess_id == cli_sess_id
                && sess.peer_uri == src_uri
            {
                let svr_ep =
                    rmps::to_vec(&state.tp.endpoint()).expect("failed to serialize local endpoint");
                let ack = SmEvent {
                    src_rpc_id: self.id,
                    dst_rpc_id: src_rpc_id,
                    src_uri: self.nexus.uri(),
                    details: SmEventDetails::ConnectAcknowledge {
                        cli_sess_id,
                        svr_ep,
                        svr_sess_id: i as SessId,
                    },
                };
                self.sm_send(&ack, src_uri);
                return;
            }
        }

        if handler_hash != self.nexus.handler_hash() {
            log::warn!(
                "RPC {}: refusing connect from RPC {}: request-type tables differ",
                self.id,
                src_rpc_id
            );
            self.sm_send(&refuse(ConnectRefuseReason::HandlerTableMismatch), src_uri);
            return;
        }
        if state.sessions.len() >= self.cfg.max_sessions {
            self.sm_send(&refuse(ConnectRefuseReason::SessionLimitExceeded), src_uri);
            return;
        }

        // An undecodable endpoint means a severe control-plane problem or a
        // peer bug; raise the log level to draw attention.
        let Ok(cli_ep) = rmps::from_slice::<Tp::Endpoint>(&cli_ep) else {
            log::error!(
                "RPC {}: ignoring ConnectRequest for session {} with invalid endpoint",
                self.id,
                cli_sess_id
            );
            return;
        };

        let peer = state.tp.make_peer(cli_ep);
        let mut sess = Session::new(
            SessionRole::Server,
            SessionState::Connected,
            src_uri,
            src_rpc_id,
            &self.cfg,
        );
        sess.peer_sess_id = cli_sess_id;
        sess.peer = Some(peer);
        let svr_sess_id = state.sessions.len() as SessId;
        state.sessions.push(sess);

        let svr_ep = rmps::to_vec(&state.tp.endpoint()).expect("failed to serialize local endpoint");
        let ack = SmEvent {
            src_rpc_id: self.id,
            dst_rpc_id: src_rpc_id,
            src_uri: self.nexus.uri(),
            details: SmEventDetails::ConnectAcknowledge {
                cli_sess_id,
                svr_ep,
                svr_sess_id,
            },
        };
        self.sm_send(&ack, src_uri);
    }

    fn on_connect_ack(
        &self,
        state: &mut RpcInterior<Tp>,
        cli_sess_id: SessId,
        svr_ep: Vec<u8>,
        svr_sess_id: SessId,
    ) {
        let Some(sess) = state.sessions.get_mut(cli_sess_id as usize) else {
            log::warn!(
                "RPC {}: ignoring ConnectAcknowledge for non-existent session {}",
                self.id,
                cli_sess_id
            );
            return;
        };
        if !sess.is_client() || sess.state != SessionState::Connecting {
            log::warn!(
                "RPC {}: ignoring ConnectAcknowledge for session {} in state {:?}",
                self.id,
                cli_sess_id,
                sess.state
            );
            return;
        }
        let Ok(svr_ep) = rmps::from_slice::<Tp::Endpoint>(&svr_ep) else {
            log::error!(
                "RPC {}: ignoring ConnectAcknowledge for session {} with invalid endpoint",
                self.id,
                cli_sess_id
            );
            return;
        };

        sess.peer_sess_id = svr_sess_id;
        sess.peer = Some(state.tp.make_peer(svr_ep));
        sess.state = SessionState::Connected;
    }

    /// Fail every in-flight and backlogged request of a session, in
    /// slot-index order, then the backlog in FIFO order.
    fn fail_inflight(
        sess: &mut Session<Tp>,
        err: Error,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        for slot in sess.slots.iter_mut() {
            if let SlotCtl::Client(_) = slot.ctl {
                if slot.is_idle() {
                    continue;
                }
                let SlotCtl::Client(ctl) = mem::replace(&mut slot.ctl, SlotCtl::Vacant) else {
                    unreachable!()
                };
                slot.state = SlotState::Idle;
                slot.timer_gen = slot.timer_gen.wrapping_add(1);
                slot.retries = 0;
                let ClientCtl { req, resp, cont, tag, .. } = *ctl;
                deliveries.push(Delivery::Completion(
                    cont.unwrap(),
                    Completion {
                        req,
                        resp,
                        tag,
                        result: Err(err),
                    },
                ));
            } else {
                slot.ctl = SlotCtl::Vacant;
                slot.state = SlotState::Idle;
                slot.timer_gen = slot.timer_gen.wrapping_add(1);
            }
        }
        for p in sess.backlog.drain(..) {
            deliveries.push(Delivery::Completion(
                p.cont,
                Completion {
                    req: p.req,
                    resp: p.resp,
                    tag: p.tag,
                    result: Err(err),
                },
            ));
        }
        sess.tx_q.clear();
    }

    /// Tear a session down on error. No further packets go to the peer.
    fn reset_session(
        &self,
        state: &mut RpcInterior<Tp>,
        sess_id: SessId,
        err: Error,
        notify_peer: bool,
        deliveries: &mut Vec<Delivery<Tp>>,
    ) {
        if matches!(
            state.sessions[sess_id as usize].state,
            SessionState::Reset | SessionState::Disconnected
        ) {
            return;
        }
        state.stats.resets += 1;

        let sess = &mut state.sessions[sess_id as usize];
        sess.state = SessionState::Reset;
        Self::fail_inflight(sess, err, deliveries);
        sess.peer = None;

        if notify_peer {
            let event = SmEvent {
                src_rpc_id: self.id,
                dst_rpc_id: sess.peer_rpc_id,
                src_uri: self.nexus.uri(),
                details: SmEventDetails::Reset {
                    dst_sess_id: sess.peer_sess_id,
                },
            };
            let uri = sess.peer_uri;
            self.sm_send(&event, uri);
        }
    }

    fn run_deliveries(&self, deliveries: Vec<Delivery<Tp>>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Handler(handle) => {
                    // The descriptor existed at dispatch; the table is frozen.
                    let desc = self.nexus.handlers().get(handle.req_type()).unwrap();
                    (desc.func)(handle);
                }
                Delivery::Completion(cont, completion) => cont(self, completion),
            }
        }
    }
}

// Transmit path: admission, credits, pacing.
impl<Tp: Transport + 'static> Rpc<Tp> {
    fn process_tx(&self) {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        let state: &mut RpcInterior<Tp> = &mut state;
        let now = self.now_us();

        self.admit_backlogs(state, now);
        self.release_queued(state, now);
        state.flush_pending();
    }

    /// Move backlogged requests into idle slots (step 7, admission).
    fn admit_backlogs(&self, state: &mut RpcInterior<Tp>, now: u64) {
        for sid in 0..state.sessions.len() {
            loop {
                let sess = &mut state.sessions[sid];
                if sess.state != SessionState::Connected || sess.backlog.is_empty() {
                    break;
                }
                let Some(slot_idx) = sess.lowest_idle_slot() else {
                    break;
                };
                let base_rto = sess.base_rto_us(&self.cfg);
                let window = sess.slots.len();
                let peer_sess_id = sess.peer_sess_id;
                let p = sess.backlog.pop_front().unwrap();
                let total = p.req.n_pkts();

                let slot = &mut sess.slots[slot_idx];
                let req_num = slot.assign_req_num(window);
                slot.req_type = p.req_type;
                slot.state = SlotState::InProgress;
                slot.retries = 0;
                slot.rto_us = base_rto;

                for pkt_idx in 0..total {
                    // SAFETY: headers interleave inside the request buffer.
                    unsafe {
                        ptr::write(
                            p.req.pkt_hdr(pkt_idx),
                            PacketHeader::new(
                                p.req_type,
                                p.req.len() as u32,
                                peer_sess_id,
                                PktType::Req,
                                pkt_idx as PktIdx,
                                req_num,
                            ),
                        );
                    }
                }

                let mut ctl = ClientCtl::new(p.req, p.resp, p.cont, p.tag, total);
                ctl.req_sent = 1; // packet 0 is queued below; the rest wait for the CR
                slot.ctl = SlotCtl::Client(Box::new(ctl));

                sess.tx_q.push_back(QueuedPkt {
                    slot_idx,
                    req_num,
                    pkt_idx: 0,
                    kind: QueuedKind::ReqData,
                    retrans: false,
                });
                state.arm_rto(sid as SessId, slot_idx, now);
            }
        }
    }

    /// Release queued data packets under credits and the pacing budget
    /// (step 7, release), round-robin across sessions.
    fn release_queued(&self, state: &mut RpcInterior<Tp>, now: u64) {
        let RpcInterior {
            sessions,
            ctrl_bufs,
            ctrl_next,
            stats,
            pending_tx,
            rr_cursor,
            ..
        } = state;

        let n_sessions = sessions.len();
        if n_sessions == 0 {
            return;
        }
        let start = *rr_cursor % n_sessions;
        *rr_cursor = (*rr_cursor + 1) % n_sessions;

        for k in 0..n_sessions {
            let sid = (start + k) % n_sessions;
            let sess = &mut sessions[sid];
            if sess.peer.is_none() || sess.tx_q.is_empty() {
                continue;
            }
            let peer = sess.peer.as_ref().unwrap() as *const Tp::Peer;
            let peer_sess_id = sess.peer_sess_id;
            if self.cfg.pacing {
                let rate = sess.cc.rate_bps();
                sess.pace.refill(now, rate);
            }

            while let Some(q) = sess.tx_q.front() {
                let slot = &sess.slots[q.slot_idx];
                // Obsolete entries (completed, reset, superseded) just drop.
                let (msgbuf, live): (*const MsgBuf, bool) = match (&slot.ctl, q.kind) {
                    (SlotCtl::Client(ctl), QueuedKind::ReqData | QueuedKind::Rfr)
                        if slot.req_num == q.req_num =>
                    {
                        (&ctl.req as *const MsgBuf, true)
                    }
                    (SlotCtl::Server(ctl), QueuedKind::RespData)
                        if slot.req_num == q.req_num && ctl.resp.is_some() =>
                    {
                        (ctl.resp.as_ref().unwrap() as *const MsgBuf, true)
                    }
                    _ => (ptr::null(), false),
                };
                if !live {
                    sess.tx_q.pop_front();
                    continue;
                }

                if self.cfg.pacing && !sess.pace.open() {
                    break;
                }
                let needs_credit = !q.retrans
                    && match q.kind {
                        QueuedKind::ReqData => q.pkt_idx == 0,
                        QueuedKind::Rfr => true,
                        QueuedKind::RespData => false,
                    };
                if needs_credit && sess.credits == 0 {
                    break;
                }

                let q = sess.tx_q.pop_front().unwrap();
                if needs_credit {
                    sess.credits -= 1;
                }

                let size = match q.kind {
                    QueuedKind::Rfr => {
                        let buf = &ctrl_bufs[*ctrl_next];
                        *ctrl_next = (*ctrl_next + 1) % ctrl_bufs.len();
                        let slot = &sess.slots[q.slot_idx];
                        // SAFETY: control buffers are ours alone.
                        unsafe {
                            ptr::write(
                                buf.pkt_hdr(0),
                                PacketHeader::new(
                                    slot.req_type,
                                    0,
                                    peer_sess_id,
                                    PktType::Rfr,
                                    q.pkt_idx,
                                    q.req_num,
                                ),
                            );
                        }
                        stats.tx_pkts += 1;
                        stats.tx_rfr += 1;
                        pending_tx.push(TxItem {
                            peer,
                            msgbuf: buf,
                            pkt_idx: 0,
                        });
                        buf.pkt_size(0)
                    }
                    QueuedKind::ReqData | QueuedKind::RespData => {
                        // SAFETY: resolved against the live slot just above.
                        let size = unsafe { (*msgbuf).pkt_size(q.pkt_idx as usize) };
                        stats.tx_pkts += 1;
                        stats.tx_data += 1;
                        pending_tx.push(TxItem {
                            peer,
                            msgbuf,
                            pkt_idx: q.pkt_idx as usize,
                        });

                        if q.kind == QueuedKind::ReqData {
                            let slot = &mut sess.slots[q.slot_idx];
                            let total = {
                                let ctl = slot.client_ctl().unwrap();
                                if !q.retrans {
                                    ctl.req_sent = ctl.req_sent.max(q.pkt_idx as usize + 1);
                                }
                                ctl.req_total
                            };
                            if q.pkt_idx == 0 || q.retrans {
                                slot.tx_ts_us = now;
                            }
                            // All request packets out (or granted): await the
                            // response.
                            if q.pkt_idx as usize == total - 1 {
                                slot.state = SlotState::AwaitingResp;
                            }
                        }
                        size
                    }
                };

                if self.cfg.pacing {
                    sess.pace.spend(size);
                }
            }
        }
    }
}

impl<Tp: Transport> Drop for Rpc<Tp> {
    fn drop(&mut self) {
        // Stop feeding the workers and collect what already came back.
        for ring in &self.to_workers {
            ring.close();
        }
        while self.local_done.pop().is_some() {}
        for ring in &self.from_workers {
            while ring.pop().is_some() {}
        }

        // Tell peers their sessions are gone so their in-flight requests
        // fail fast instead of waiting out the retransmission cap.
        if let Ok(state) = self.state.try_borrow() {
            for sess in state.sessions.iter() {
                if !matches!(
                    sess.state,
                    SessionState::Connected | SessionState::Disconnecting
                ) {
                    continue;
                }
                let event = SmEvent {
                    src_rpc_id: self.id,
                    dst_rpc_id: sess.peer_rpc_id,
                    src_uri: self.nexus.uri(),
                    details: SmEventDetails::Reset {
                        dst_sess_id: sess.peer_sess_id,
                    },
                };
                self.sm_send(&event, sess.peer_uri);
            }
        }

        self.nexus.deregister_rpc(self.id);
        BOUND_RPC.with(|slot| slot.set(None));
    }
}
