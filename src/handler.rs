//! Request handlers and the handles passed to them.

use std::array;
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, OnceLock};

use crate::msgbuf::MsgBuf;
use crate::type_alias::*;
use crate::util::spsc::Spsc;

/// Where a registered handler executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// On the event-loop thread, during the receive pass. Must not block.
    Inline,
    /// On a Nexus worker thread. May block; transport-visible work still
    /// happens on the owning event loop.
    Background,
}

/// Request handler function trait.
///
/// A handler receives ownership of the [`ReqHandle`], fills in the response
/// buffer, and finishes with [`ReqHandle::respond()`]: immediately, or later
/// from a continuation for nested RPCs. Handlers run for every request
/// exactly once.
pub type ReqHandlerFn = Box<dyn Fn(ReqHandle) + Send + Sync + 'static>;

pub(crate) struct HandlerDesc {
    pub func: ReqHandlerFn,
    pub mode: HandlerMode,
}

/// The Nexus's request-type dispatch table.
///
/// Written under registration checks before any instance exists, read
/// lock-free on the datapath afterwards.
pub(crate) struct HandlerTable {
    entries: [OnceLock<HandlerDesc>; 1 + ReqType::MAX as usize],
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            entries: array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Install a handler.
    ///
    /// # Panics
    ///
    /// Panic if the request type already has one.
    pub fn set(&self, req_type: ReqType, desc: HandlerDesc) {
        if self.entries[req_type as usize].set(desc).is_err() {
            panic!("handler for request type {req_type} registered twice");
        }
    }

    #[inline(always)]
    pub fn get(&self, req_type: ReqType) -> Option<&HandlerDesc> {
        self.entries[req_type as usize].get()
    }

    /// Digest of the registered (type, mode) set. Exchanged during session
    /// setup so mismatched endpoints refuse each other early.
    pub fn type_hash(&self) -> u64 {
        let mut h = ahash::RandomState::with_seeds(
            0x9e37_79b9_7f4a_7c15,
            0xf39c_c060_5ced_c834,
            0x1082_276b_f3a2_7251,
            0xb492_b66f_be98_f273,
        )
        .build_hasher();
        for ty in 0..=ReqType::MAX {
            if let Some(desc) = self.get(ty) {
                h.write_u8(ty);
                h.write_u8(desc.mode as u8);
            }
        }
        h.finish()
    }
}

/// The guts of a [`ReqHandle`], shipped home over a completion ring.
pub(crate) struct RespItem {
    pub sess_id: SessId,
    pub slot_idx: usize,
    pub req_num: ReqIdx,
    pub req_type: ReqType,

    /// The reassembled request.
    pub req: MsgBuf,
    /// Pre-allocated response buffer, one packet's worth of capacity.
    pub resp: MsgBuf,
    /// A larger response installed by the handler, if any.
    pub dyn_resp: Option<MsgBuf>,
    /// `false` means the handler dropped the handle without responding.
    pub responded: bool,
}

/// An in-flight request on the server side, owned by its handler.
///
/// Every handle eventually travels back to the event loop that created it:
/// [`respond`](Self::respond) sends it, and dropping it sends it marked
/// unanswered. The handle may cross into a worker thread and may outlive the
/// handler invocation (stash it in a continuation for nested RPCs).
pub struct ReqHandle {
    item: Option<RespItem>,
    /// Completion ring of the owning event loop.
    home: Arc<Spsc<RespItem>>,
}

impl ReqHandle {
    pub(crate) fn new(item: RespItem, home: Arc<Spsc<RespItem>>) -> Self {
        Self {
            item: Some(item),
            home,
        }
    }

    #[inline]
    fn item(&self) -> &RespItem {
        self.item.as_ref().expect("handle already responded")
    }

    /// Type of the request.
    #[inline]
    pub fn req_type(&self) -> ReqType {
        self.item().req_type
    }

    /// The request message.
    #[inline]
    pub fn req_buf(&self) -> &MsgBuf {
        &self.item().req
    }

    /// The response buffer to fill. Holds one packet's worth of capacity;
    /// install a larger buffer with [`set_dyn_resp`](Self::set_dyn_resp).
    #[inline]
    pub fn resp_buf(&mut self) -> &mut MsgBuf {
        let item = self.item.as_mut().expect("handle already responded");
        item.dyn_resp.as_mut().unwrap_or(&mut item.resp)
    }

    /// Replace the pre-allocated response with a caller-provided buffer,
    /// e.g. one sized for a multi-packet response.
    #[inline]
    pub fn set_dyn_resp(&mut self, buf: MsgBuf) {
        self.item.as_mut().expect("handle already responded").dyn_resp = Some(buf);
    }

    /// Hand the filled response back to the owning event loop, which
    /// transmits it. Works from handler context on any thread.
    pub fn respond(mut self) {
        let mut item = self.item.take().unwrap();
        item.responded = true;
        self.send_home(item);
    }

    fn send_home(&self, item: RespItem) {
        if let Err(item) = self.home.push(item) {
            // The owning event loop is gone or hopelessly backlogged. The
            // buffers keep their allocator alive, so dropping them here on a
            // foreign thread is safe, just wasteful.
            log::error!(
                "completion ring rejected response for request {} on session {}",
                item.req_num,
                item.sess_id
            );
        }
    }
}

impl Drop for ReqHandle {
    fn drop(&mut self) {
        // Dropped without responding: still go home so the slot can be
        // reclaimed and the omission logged on the owning thread.
        if let Some(item) = self.item.take() {
            self.send_home(item);
        }
    }
}
