mod sslot;

use std::collections::VecDeque;
use std::net::SocketAddr;

pub(crate) use self::sslot::*;
use crate::config::RpcConfig;
use crate::msgbuf::MsgBuf;
use crate::rpc::timely::{PaceState, TimelyState};
use crate::rpc::Continuation;
use crate::transport::Transport;
use crate::type_alias::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

/// Connection status, driven by the session-management protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Connecting,
    Connected,
    /// Local teardown initiated, waiting for the peer's acknowledgement.
    Disconnecting,
    /// Both sides have acknowledged teardown.
    Disconnected,
    /// The peer died, refused the connection, or ran out of retransmissions.
    Reset,
}

/// A request accepted while no slot or credit was available.
pub(crate) struct PendingRequest<Tp: Transport> {
    pub req_type: ReqType,
    pub req: MsgBuf,
    pub resp: MsgBuf,
    pub cont: Continuation<Tp>,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuedKind {
    ReqData,
    RespData,
    Rfr,
}

/// A packet waiting in the session's paced TX queue.
pub(crate) struct QueuedPkt {
    pub slot_idx: usize,
    /// Request number the packet belongs to; a mismatch with the slot's
    /// current number at release time means the packet is obsolete.
    pub req_num: ReqIdx,
    pub pkt_idx: PktIdx,
    pub kind: QueuedKind,
    /// Retransmissions bypass credit accounting.
    pub retrans: bool,
}

/// A bidirectional channel to one remote RPC instance.
pub(crate) struct Session<Tp: Transport> {
    pub role: SessionRole,
    pub state: SessionState,

    /// Peer Nexus session-management address.
    pub peer_uri: SocketAddr,
    pub peer_rpc_id: RpcId,
    pub peer_sess_id: SessId,
    /// Peer routing info; present once connected.
    pub peer: Option<Tp::Peer>,

    /// Flow-control credits, initially the window size.
    pub credits: usize,
    /// The request window.
    pub slots: Vec<SSlot<Tp>>,
    /// Requests waiting for a slot or credit.
    pub backlog: VecDeque<PendingRequest<Tp>>,
    /// Data packets awaiting pacing and credits.
    pub tx_q: VecDeque<QueuedPkt>,

    /// Rate control.
    pub cc: TimelyState,
    pub pace: PaceState,
    /// Smoothed RTT in microseconds; 0 until the first sample.
    pub srtt_us: u64,

    /// Connect requests sent so far, for SM retries.
    pub connect_attempts: u32,
}

impl<Tp: Transport> Session<Tp> {
    pub fn new(
        role: SessionRole,
        state: SessionState,
        peer_uri: SocketAddr,
        peer_rpc_id: RpcId,
        cfg: &RpcConfig,
    ) -> Self {
        Self {
            role,
            state,
            peer_uri,
            peer_rpc_id,
            peer_sess_id: 0,
            peer: None,
            credits: cfg.session_credits,
            slots: (0..cfg.req_window).map(SSlot::new).collect(),
            backlog: VecDeque::new(),
            tx_q: VecDeque::new(),
            cc: TimelyState::new(&cfg.timely),
            pace: PaceState::new(),
            srtt_us: 0,
            connect_attempts: 0,
        }
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline(always)]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Lowest-indexed idle slot, if any.
    #[inline]
    pub fn lowest_idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_idle())
    }

    /// Fold an RTT sample into the smoothed estimate.
    pub fn observe_rtt(&mut self, rtt_us: u64, cfg: &RpcConfig) {
        self.srtt_us = if self.srtt_us == 0 {
            rtt_us
        } else {
            (self.srtt_us * 7 + rtt_us) / 8
        };
        self.cc.update(rtt_us, &cfg.timely);
    }

    /// Retransmission timeout base: the configured floor, scaled up by the
    /// observed RTT but kept under the timing wheel's horizon so the
    /// exponential backoff stays addressable.
    pub fn base_rto_us(&self, cfg: &RpcConfig) -> u64 {
        (2 * self.srtt_us).clamp(cfg.rto_floor_us, cfg.rto_floor_us + cfg.rto_floor_us / 5)
    }
}
