//! Control-plane tests: instance creation, session setup, refusals.

use super::*;

const RPC_PING: ReqType = 1;

fn set_handlers(nx: &Nexus) {
    nx.register_handler(RPC_PING, HandlerMode::Inline, |mut req| {
        req.resp_buf().set_len(0);
        req.respond();
    });
}

/// One instance per thread, many threads per Nexus.
#[test]
fn create_rpcs() {
    init_logger();
    let nexus = loopback_nexus(0);
    let handles: Vec<_> = (1..=16)
        .map(|i| {
            let nexus = nexus.clone();
            thread::spawn(move || {
                let _ = Rpc::new(&nexus, i, loopback_udp(), RpcConfig::default());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Two instances on one thread is a bug the thread-local slot catches.
#[test]
#[should_panic(expected = "already owns an Rpc instance")]
fn one_instance_per_thread() {
    let nexus = loopback_nexus(0);
    let _a = Rpc::new(&nexus, 1, loopback_udp(), RpcConfig::default());
    let _b = Rpc::new(&nexus, 2, loopback_udp(), RpcConfig::default());
}

/// Sessions connect from two client instances to one server instance.
#[test]
fn connect_sessions() {
    init_logger();

    let (uri_tx, uri_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let nx = loopback_nexus(0);
        set_handlers(&nx);
        let rpc = Rpc::new(&nx, 3, loopback_udp(), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });
    let svr_uri: SocketAddr = uri_rx.recv().unwrap();

    let worker = |rpc_id: RpcId| {
        let svr_uri = svr_uri;
        move || {
            let nx = loopback_nexus(0);
            set_handlers(&nx);
            let rpc = Rpc::new(&nx, rpc_id, loopback_udp(), RpcConfig::default());
            for i in 0..10u16 {
                let sess = rpc.create_session(svr_uri, 3).unwrap();
                assert_eq!(sess, i);
                connect_or_die(&rpc, sess);
                assert!(rpc.is_connected(sess));
            }
        }
    };

    let c1 = thread::spawn(worker(1));
    let c2 = thread::spawn(worker(2));
    c1.join().unwrap();
    c2.join().unwrap();

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// The per-instance session cap reports synchronously.
#[test]
fn session_cap() {
    init_logger();
    let nx = loopback_nexus(0);
    set_handlers(&nx);
    let cfg = RpcConfig::default().with_max_sessions(2);
    let rpc = Rpc::new(&nx, 1, loopback_udp(), cfg);

    let dst: SocketAddr = "127.0.0.1:9".parse().unwrap();
    rpc.create_session(dst, 2).unwrap();
    rpc.create_session(dst, 2).unwrap();
    assert_eq!(
        rpc.create_session(dst, 2).unwrap_err(),
        Error::TooManySessions
    );
}

/// Endpoints whose request-type tables differ refuse to talk.
#[test]
fn handler_table_mismatch() {
    init_logger();

    let (uri_tx, uri_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let nx = loopback_nexus(0);
        set_handlers(&nx);
        let rpc = Rpc::new(&nx, 2, loopback_udp(), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });

    // This Nexus registers nothing, so its table digest differs.
    let nx = loopback_nexus(0);
    let rpc = Rpc::new(&nx, 1, loopback_udp(), RpcConfig::default());

    let svr_uri: SocketAddr = uri_rx.recv().unwrap();
    let sess = rpc.create_session(svr_uri, 2).unwrap();

    let failed = Arc::new(AtomicUsize::new(0));
    let failed2 = failed.clone();
    let req = rpc.alloc_msg_buffer(4).unwrap();
    let resp = rpc.alloc_msg_buffer(4).unwrap();
    rpc.enqueue_request(
        sess,
        RPC_PING,
        req,
        resp,
        move |_, comp| {
            assert_eq!(comp.result.unwrap_err(), Error::InvalidRemoteRpcId);
            failed2.fetch_add(1, Ordering::SeqCst);
        },
        0,
    )
    .unwrap();

    assert!(spin_until(&rpc, Duration::from_secs(5), || failed
        .load(Ordering::SeqCst)
        == 1));
    assert!(!rpc.is_connected(sess));

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}
