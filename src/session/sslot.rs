use bitvec::vec::BitVec;

use crate::msgbuf::MsgBuf;
use crate::rpc::Continuation;
use crate::transport::Transport;
use crate::type_alias::*;

/// Protocol state of one request slot.
///
/// ```text
/// Idle  --request admitted-->  InProgress
/// InProgress  --all request pkts out/granted-->  AwaitingResp
/// InProgress  --timeout-->  InProgress (retransmit)
/// AwaitingResp  --response complete-->  Idle (continuation fires)
/// AwaitingResp  --timeout-->  AwaitingResp (re-pull / retransmit)
/// any  --session reset-->  Idle (continuation fires with error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle,
    InProgress,
    AwaitingResp,
}

/// Client-side control block of an active slot.
pub(crate) struct ClientCtl<Tp: Transport> {
    pub req: MsgBuf,
    pub resp: MsgBuf,
    pub cont: Option<Continuation<Tp>>,
    pub tag: u64,

    /// Packets in the request message.
    pub req_total: usize,
    /// Request packets handed to the TX queue so far.
    pub req_sent: usize,
    /// The server's credit return has arrived.
    pub cr_seen: bool,

    /// Packets in the response, known after segment 0.
    pub resp_total: Option<usize>,
    /// Response size announced by the peer.
    pub resp_msg_size: usize,
    /// Distinct response segments received.
    pub resp_rcvd: usize,
    /// Duplicate filter over response segments.
    pub resp_seen: BitVec,
    /// Lowest response segment still missing.
    pub resp_next: usize,
    /// Highest response segment pulled so far; each segment is pulled once,
    /// timeouts re-pull without advancing this.
    pub rfr_hwm: usize,
}

impl<Tp: Transport> ClientCtl<Tp> {
    pub fn new(
        req: MsgBuf,
        resp: MsgBuf,
        cont: Continuation<Tp>,
        tag: u64,
        req_total: usize,
    ) -> Self {
        Self {
            req,
            resp,
            cont: Some(cont),
            tag,
            req_total,
            req_sent: 0,
            cr_seen: false,
            resp_total: None,
            resp_msg_size: 0,
            resp_rcvd: 0,
            resp_seen: BitVec::new(),
            resp_next: 0,
            rfr_hwm: 0,
        }
    }
}

/// Server-side control block of an active slot.
pub(crate) struct ServerCtl {
    /// Request reassembly buffer.
    pub req: Option<MsgBuf>,
    /// Packets in the request message.
    pub req_total: usize,
    /// Distinct request packets received.
    pub req_rcvd: usize,
    /// Duplicate filter over request packets.
    pub req_seen: BitVec,
    /// The credit return for a multi-packet request went out.
    pub cr_sent: bool,
    /// The enqueued response; kept until the slot is reused so that late
    /// response pulls can be honored.
    pub resp: Option<MsgBuf>,
}

impl ServerCtl {
    pub fn new(req: MsgBuf, req_total: usize) -> Self {
        Self {
            req: Some(req),
            req_total,
            req_rcvd: 0,
            req_seen: BitVec::repeat(false, req_total),
            cr_sent: false,
            resp: None,
        }
    }
}

/// Role-specific contents of a slot, driven by explicit transitions.
pub(crate) enum SlotCtl<Tp: Transport> {
    /// Nothing outstanding.
    Vacant,
    Client(Box<ClientCtl<Tp>>),
    Server(ServerCtl),
}

/// One element of a session's request window.
pub(crate) struct SSlot<Tp: Transport> {
    pub state: SlotState,
    pub ctl: SlotCtl<Tp>,

    /// Request number currently bound to the slot.
    pub req_num: ReqIdx,
    /// Next request number to assign here. Starts at the slot index and
    /// advances by the window size, so receivers can demultiplex with
    /// `req_num % window`.
    pub next_req_num: ReqIdx,
    pub req_type: ReqType,

    /// Timestamp of the oldest unacknowledged transmission, for RTT samples.
    pub tx_ts_us: u64,
    /// Current retransmission timeout.
    pub rto_us: u64,
    /// Retransmissions of the current request.
    pub retries: u32,
    /// Arming generation; a fired timer with a stale generation is ignored.
    pub timer_gen: u32,
}

impl<Tp: Transport> SSlot<Tp> {
    pub fn new(idx: usize) -> Self {
        Self {
            state: SlotState::Idle,
            ctl: SlotCtl::Vacant,
            req_num: 0,
            next_req_num: idx as ReqIdx,
            req_type: 0,
            tx_ts_us: 0,
            rto_us: 0,
            retries: 0,
            timer_gen: 0,
        }
    }

    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    /// Bind the next request number to this slot.
    pub fn assign_req_num(&mut self, window: usize) -> ReqIdx {
        self.req_num = self.next_req_num;
        self.next_req_num += window as ReqIdx;
        self.req_num
    }

    pub fn client_ctl(&mut self) -> Option<&mut ClientCtl<Tp>> {
        match &mut self.ctl {
            SlotCtl::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn server_ctl(&mut self) -> Option<&mut ServerCtl> {
        match &mut self.ctl {
            SlotCtl::Server(c) => Some(c),
            _ => None,
        }
    }
}
