//! Type aliases used in this library.

/// [`u8`]: Rpc instance identifier, unique within a [`Nexus`](crate::Nexus).
/// Note that this distinguishes `Rpc` instances (control-plane), not RPC requests (data-plane).
pub type RpcId = u8;

/// [`u16`]: Session identifier, an index into the owning instance's session table.
pub type SessId = u16;

/// [`u8`]: Request type identifier.
pub type ReqType = u8;

/// [`u64`]: Request index within a (session, slot) pair.
pub(crate) type ReqIdx = u64;

/// [`u16`] (12 bits valid): Packet index within a message.
pub(crate) type PktIdx = u16;
