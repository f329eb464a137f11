//! A low-latency, connection-oriented RPC engine over unreliable datagram
//! transports.
//!
//! `uddrpc` provides reliable request/response messaging for datacenter
//! networks: a single-threaded event loop per endpoint, a sliding request
//! window per session with credit-based flow control and explicit loss
//! recovery, Timely-style rate pacing, and a background worker pool for
//! handlers that may block. Transports are pluggable behind the
//! [`Transport`] trait; a commodity kernel-UDP backend ships as the
//! reference implementation.
//!
//! The control plane (session setup and teardown) runs over a side-channel
//! UDP socket owned by the process-wide [`Nexus`]; the datapath never blocks
//! on it.

mod config;
mod error;
mod handler;
mod msgbuf;
mod nexus;
mod pkthdr;
mod rpc;
mod session;
mod transport;
pub mod type_alias;
mod util;

pub use self::config::{RpcConfig, TimelyConfig};
pub use self::error::{Error, Result};
pub use self::handler::{HandlerMode, ReqHandle};
pub use self::msgbuf::MsgBuf;
pub use self::nexus::Nexus;
pub use self::rpc::{Completion, DpathStats, Rpc};
pub use self::transport::{LKey, Transport, TxItem, UdpConfig, UdpTransport};

#[cfg(test)]
mod tests;
