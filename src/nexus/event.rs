use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::type_alias::*;

/// Reasons for refusing a connection request.
#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize)]
pub(crate) enum ConnectRefuseReason {
    #[error("invalid Rpc ID")]
    InvalidRpcId,

    #[error("session limit exceeded")]
    SessionLimitExceeded,

    #[error("request-type tables differ")]
    HandlerTableMismatch,
}

/// Details of a [`SmEvent`].
///
/// Transport endpoints travel as opaque msgpack blobs so the control plane
/// stays independent of the backend in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum SmEventDetails {
    /// A request sent from a remote peer to connect to a local `Rpc`.
    /// The sender's management address rides in [`SmEvent::src_uri`].
    ConnectRequest {
        cli_ep: Vec<u8>,
        cli_sess_id: SessId,
        handler_hash: u64,
    },

    /// Positive response to a `ConnectRequest`.
    ConnectAcknowledge {
        cli_sess_id: SessId,
        svr_ep: Vec<u8>,
        svr_sess_id: SessId,
    },

    /// Negative response to a `ConnectRequest`.
    ConnectRefuse {
        cli_sess_id: SessId,
        reason: ConnectRefuseReason,
    },

    /// Graceful teardown request for the receiver's session `dst_sess_id`.
    Disconnect {
        dst_sess_id: SessId,
        src_sess_id: SessId,
    },

    /// Teardown confirmation for the receiver's session `dst_sess_id`.
    DisconnectAck { dst_sess_id: SessId },

    /// The sender died or abandoned the session; fail everything in flight.
    Reset { dst_sess_id: SessId },
}

/// Event routed by the session-management thread into an `Rpc` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SmEvent {
    /// ID of the `Rpc` instance this event comes from.
    pub(crate) src_rpc_id: RpcId,

    /// ID of the `Rpc` instance this event is targeted at.
    pub(crate) dst_rpc_id: RpcId,

    /// Sender's management address, for replies.
    pub(crate) src_uri: SocketAddr,

    pub(crate) details: SmEventDetails,
}

/// Event sender, held by the session-management thread.
pub(crate) struct SmEventTx(Arc<SegQueue<SmEvent>>);

impl SmEventTx {
    pub(crate) fn send(&self, event: SmEvent) {
        self.0.push(event);
    }
}

/// Event receiver, drained by the owning event loop.
pub(crate) struct SmEventRx(Arc<SegQueue<SmEvent>>);

impl SmEventRx {
    pub(crate) fn recv(&self) -> Option<SmEvent> {
        self.0.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Create a connected event channel pair.
pub(crate) fn sm_event_channel() -> (SmEventTx, SmEventRx) {
    let queue = Arc::new(SegQueue::new());
    (SmEventTx(queue.clone()), SmEventRx(queue))
}
