mod event;
mod registry;
mod worker;

use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::{thread, time};

use rmp_serde as rmps;

pub(crate) use self::event::*;
pub(crate) use self::registry::Registry;
pub(crate) use self::worker::{WorkerCtl, WorkerLane};
use crate::handler::{HandlerDesc, HandlerMode, HandlerTable, ReqHandle};
use crate::type_alias::*;
use crate::util::spsc::Spsc;

/// Depth of each (instance, worker) hand-off ring.
const LANE_DEPTH: usize = 1 << 10;

/// Session management part of [`Nexus`].
struct NexusSm {
    uri: SocketAddr,
    registry: Arc<Registry>,
    should_stop: AtomicBool,
}

impl NexusSm {
    /// Listen on the management socket and route events to their instances.
    fn listen(self: Arc<Self>, socket: UdpSocket) {
        const EVENT_MSG_SIZE_LIMIT: usize = 4 << 10; // 4 KiB
        let mut buf = [0u8; EVENT_MSG_SIZE_LIMIT];
        while !self.should_stop.load(Ordering::Relaxed) {
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => {
                    log::debug!("Nexus SM: transient receive error: {}", e);
                    continue;
                }
            };
            let Ok(evt) = rmps::from_slice::<SmEvent>(&buf[..amt]) else {
                // The management channel is plain UDP; drop what does not parse.
                log::debug!("Nexus SM: ignoring malformed event from {}", src);
                continue;
            };

            let is_connect = matches!(evt.details, SmEventDetails::ConnectRequest { .. });
            let dst_rpc_id = evt.dst_rpc_id;
            let src_rpc_id = evt.src_rpc_id;
            let reply_to = evt.src_uri;
            let cli_sess_id = match &evt.details {
                SmEventDetails::ConnectRequest { cli_sess_id, .. } => *cli_sess_id,
                _ => 0,
            };

            if !self.registry.route(evt) {
                log::debug!("Nexus SM: no local RPC {} for event", dst_rpc_id);
                if is_connect {
                    // Answer for the absent instance so the peer fails fast.
                    let refuse = SmEvent {
                        src_rpc_id: dst_rpc_id,
                        dst_rpc_id: src_rpc_id,
                        src_uri: self.uri,
                        details: SmEventDetails::ConnectRefuse {
                            cli_sess_id,
                            reason: ConnectRefuseReason::InvalidRpcId,
                        },
                    };
                    let msg = rmps::to_vec(&refuse).expect("failed to serialize ConnectRefuse");
                    if let Err(e) = socket.send_to(&msg, reply_to) {
                        log::warn!("Nexus SM: failed to send ConnectRefuse: {}", e);
                    }
                }
            }
        }
    }
}

struct Worker {
    ctl: Arc<WorkerCtl>,
    thread: Option<thread::JoinHandle<()>>,
}

/// The process-wide endpoint: handler table, session-management thread,
/// background worker pool, and instance registry.
///
/// Register every handler before creating the first [`Rpc`](crate::Rpc);
/// afterwards the table is read lock-free by every datapath.
pub struct Nexus {
    handlers: Arc<HandlerTable>,
    handler_hash: OnceLock<u64>,
    registry: Arc<Registry>,

    sm: Arc<NexusSm>,
    sm_thread: Option<thread::JoinHandle<()>>,

    workers: Vec<Worker>,

    /// Set once the first instance registers; freezes the handler table.
    datapath_active: AtomicBool,
}

impl Nexus {
    /// Create a Nexus listening on the given management URI, with
    /// `bg_workers` background handler threads.
    ///
    /// # Panics
    ///
    /// Panic if the URI cannot be resolved or bound.
    pub fn new(uri: impl ToSocketAddrs, bg_workers: usize) -> Pin<Arc<Self>> {
        let uri = uri
            .to_socket_addrs()
            .expect("failed to resolve management URI")
            .next()
            .expect("management URI resolves to nothing");
        let socket = UdpSocket::bind(uri).expect("failed to bind management socket");

        const SOCKET_READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT)).unwrap();
        let uri = socket.local_addr().unwrap();

        let registry = Arc::new(Registry::new());
        let sm = Arc::new(NexusSm {
            uri,
            registry: registry.clone(),
            should_stop: AtomicBool::new(false),
        });
        let sm_thread = {
            let sm = sm.clone();
            thread::spawn(move || sm.listen(socket))
        };

        let handlers = Arc::new(HandlerTable::new());
        let workers = (0..bg_workers)
            .map(|_| {
                let ctl = Arc::new(WorkerCtl::new());
                let thread = {
                    let ctl = ctl.clone();
                    let handlers = handlers.clone();
                    thread::spawn(move || worker::worker_main(ctl, handlers))
                };
                Worker {
                    ctl,
                    thread: Some(thread),
                }
            })
            .collect();

        Arc::pin(Self {
            handlers,
            handler_hash: OnceLock::new(),
            registry,
            sm,
            sm_thread: Some(sm_thread),
            workers,
            datapath_active: AtomicBool::new(false),
        })
    }

    /// The management address this Nexus listens on.
    #[inline]
    pub fn uri(&self) -> SocketAddr {
        self.sm.uri
    }

    /// Register the handler for a request type.
    ///
    /// # Panics
    ///
    /// - Panic if an `Rpc` instance already exists on this Nexus.
    /// - Panic if the request type already has a handler.
    pub fn register_handler<H>(&self, req_type: ReqType, mode: HandlerMode, handler: H) -> &Self
    where
        H: Fn(ReqHandle) + Send + Sync + 'static,
    {
        assert!(
            !self.datapath_active.load(Ordering::SeqCst),
            "handlers must be registered before any Rpc is created"
        );
        self.handlers.set(
            req_type,
            HandlerDesc {
                func: Box::new(handler),
                mode,
            },
        );
        self
    }

    /// Digest of the handler table, fixed once the datapath starts.
    pub(crate) fn handler_hash(&self) -> u64 {
        *self.handler_hash.get_or_init(|| self.handlers.type_hash())
    }

    #[inline(always)]
    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Wire a new instance in: event channel plus one hand-off ring per
    /// worker.
    ///
    /// # Panics
    ///
    /// Panic if the ID is already in use.
    pub(crate) fn register_rpc(&self, id: RpcId) -> (SmEventRx, Vec<Arc<Spsc<ReqHandle>>>) {
        self.datapath_active.store(true, Ordering::SeqCst);
        self.handler_hash(); // freeze the digest

        let (tx, rx) = sm_event_channel();
        self.registry.insert(id, tx);

        let lanes = self
            .workers
            .iter()
            .map(|w| {
                let ring = Arc::new(Spsc::new(LANE_DEPTH));
                w.ctl.new_lanes.push(WorkerLane {
                    inbound: ring.clone(),
                });
                ring
            })
            .collect();
        (rx, lanes)
    }

    pub(crate) fn deregister_rpc(&self, id: RpcId) {
        self.registry.remove(id);
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.sm.should_stop.store(true, Ordering::SeqCst);
        self.sm_thread.take().unwrap().join().unwrap();

        for worker in &mut self.workers {
            worker.ctl.stop.store(true, Ordering::SeqCst);
        }
        for worker in &mut self.workers {
            worker.thread.take().unwrap().join().unwrap();
        }
    }
}
