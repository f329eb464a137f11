#![allow(unused_imports)]

use std::net::SocketAddr;
use std::sync::atomic::*;
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::Duration;
use std::{ptr, thread};

use log::LevelFilter;
use simple_logger::SimpleLogger;

use super::{type_alias::*, *};

mod control_plane;
mod large;
mod reset;

pub(self) fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Warn).init();
}

/// A datapath transport on an ephemeral loopback port.
pub(self) fn loopback_udp() -> UdpTransport {
    UdpTransport::bind(("127.0.0.1", 0))
}

pub(self) fn loopback_udp_with(cfg: UdpConfig) -> UdpTransport {
    UdpTransport::bind_with(("127.0.0.1", 0), cfg)
}

/// A Nexus on an ephemeral loopback management port.
pub(self) fn loopback_nexus(bg_workers: usize) -> std::pin::Pin<Arc<Nexus>> {
    Nexus::new(("127.0.0.1", 0), bg_workers)
}

/// Drive the event loop until `cond` holds or `timeout` passes.
pub(self) fn spin_until(
    rpc: &Rpc<UdpTransport>,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        rpc.run_event_loop_once();
        if cond() {
            return true;
        }
    }
    false
}

/// Drive the event loop until the session is connected.
pub(self) fn connect_or_die(rpc: &Rpc<UdpTransport>, sess_id: SessId) {
    assert!(
        spin_until(rpc, Duration::from_secs(5), || rpc.is_connected(sess_id)),
        "session {sess_id} failed to connect"
    );
}

/// Fill a message buffer with a byte pattern.
pub(self) fn fill(buf: &mut MsgBuf, byte: u8) {
    unsafe { ptr::write_bytes(buf.as_ptr(), byte, buf.len()) };
}

/// Copy a message buffer's payload out.
pub(self) fn payload_of(buf: &MsgBuf) -> Vec<u8> {
    unsafe { buf.as_slice().to_vec() }
}
