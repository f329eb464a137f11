//! Session teardown and reset tests.

use super::*;

const RPC_MAYBE: ReqType = 60;
const RPC_ECHO: ReqType = 61;

/// Answer the first `n` requests, sit on the rest forever.
fn set_limited_handler(nx: &Nexus, n: usize, parked: Arc<Mutex<Vec<ReqHandle>>>) {
    let served = Arc::new(AtomicUsize::new(0));
    nx.register_handler(RPC_MAYBE, HandlerMode::Inline, move |mut req| {
        if served.fetch_add(1, Ordering::SeqCst) < n {
            let data = payload_of(req.req_buf());
            let resp = req.resp_buf();
            resp.set_len(data.len());
            unsafe { resp.as_mut_slice().copy_from_slice(&data) };
            req.respond();
        } else {
            parked.lock().unwrap().push(req);
        }
    });
}

/// Scenario: eight concurrent requests, the peer instance dies after four
/// responses. The remaining four continuations fire with a session-reset
/// error, and the session stops talking to that peer.
#[test]
fn peer_death_mid_flight() {
    init_logger();

    let (uri_tx, uri_rx) = mpsc::channel();
    let (die_tx, die_rx) = mpsc::channel::<()>();
    let (dead_tx, dead_rx) = mpsc::channel::<()>();
    let parked = Arc::new(Mutex::new(Vec::new()));

    let handle = thread::spawn({
        let parked = parked.clone();
        move || {
            let nx = loopback_nexus(0);
            set_limited_handler(&nx, 4, parked.clone());
            let rpc = Rpc::new(&nx, 2, loopback_udp(), RpcConfig::default());
            uri_tx.send(nx.uri()).unwrap();
            while die_rx.try_recv().is_err() {
                rpc.run_event_loop_once();
            }
            // Unanswered handles die with the instance.
            parked.lock().unwrap().clear();
            drop(rpc);
            dead_tx.send(()).unwrap();
        }
    });

    let nx = loopback_nexus(0);
    set_limited_handler(&nx, 4, Arc::new(Mutex::new(Vec::new())));
    let rpc = Rpc::new(&nx, 1, loopback_udp(), RpcConfig::default());

    let svr_uri: SocketAddr = uri_rx.recv().unwrap();
    let sess = rpc.create_session(svr_uri, 2).unwrap();
    connect_or_die(&rpc, sess);

    let ok = Arc::new(AtomicUsize::new(0));
    let reset = Arc::new(AtomicUsize::new(0));
    for i in 0..8usize {
        let ok2 = ok.clone();
        let reset2 = reset.clone();
        let req = rpc.alloc_msg_buffer(32).unwrap();
        let resp = rpc.alloc_msg_buffer(32).unwrap();
        rpc.enqueue_request(
            sess,
            RPC_MAYBE,
            req,
            resp,
            move |_, comp| match comp.result {
                Ok(()) => {
                    ok2.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    assert_eq!(e, Error::SessionReset);
                    reset2.fetch_add(1, Ordering::SeqCst);
                }
            },
            i as u64,
        )
        .unwrap();
    }

    // Four answers arrive, then the peer goes away.
    assert!(spin_until(&rpc, Duration::from_secs(5), || ok
        .load(Ordering::SeqCst)
        == 4));
    die_tx.send(()).unwrap();
    dead_rx.recv().unwrap();

    // The survivors all fail with the reset error, exactly once each.
    assert!(spin_until(&rpc, Duration::from_secs(5), || reset
        .load(Ordering::SeqCst)
        == 4));
    assert_eq!(ok.load(Ordering::SeqCst), 4);
    assert!(!rpc.is_connected(sess));

    // The dead session refuses new work.
    let req = rpc.alloc_msg_buffer(8).unwrap();
    let resp = rpc.alloc_msg_buffer(8).unwrap();
    let err = rpc
        .enqueue_request(sess, RPC_MAYBE, req, resp, |_, _| unreachable!(), 0)
        .unwrap_err();
    assert_eq!(err, Error::Disconnected);

    handle.join().unwrap();
}

fn set_echo_handler(nx: &Nexus) {
    nx.register_handler(RPC_ECHO, HandlerMode::Inline, |mut req| {
        let data = payload_of(req.req_buf());
        let resp = req.resp_buf();
        resp.set_len(data.len());
        unsafe { resp.as_mut_slice().copy_from_slice(&data) };
        req.respond();
    });
}

/// `destroy_session` cancels everything in flight with the reset error and
/// completes a graceful teardown with the peer.
#[test]
fn destroy_session_cancels_inflight() {
    init_logger();

    let (uri_tx, uri_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let nx = loopback_nexus(0);
        set_echo_handler(&nx);
        // Do not run the event loop: requests stay in flight on the client.
        let rpc = Rpc::new(&nx, 2, loopback_udp(), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        stop_rx.recv().unwrap();
        drop(rpc);
    });

    let nx = loopback_nexus(0);
    set_echo_handler(&nx);
    let rpc = Rpc::new(&nx, 1, loopback_udp(), RpcConfig::default());

    let svr_uri: SocketAddr = uri_rx.recv().unwrap();
    let sess = rpc.create_session(svr_uri, 2).unwrap();

    // Connection cannot complete (the server loop never runs), so these
    // requests sit in the backlog until the session dies.
    let failed = Arc::new(AtomicUsize::new(0));
    for i in 0..3usize {
        let failed2 = failed.clone();
        let req = rpc.alloc_msg_buffer(8).unwrap();
        let resp = rpc.alloc_msg_buffer(8).unwrap();
        rpc.enqueue_request(
            sess,
            RPC_ECHO,
            req,
            resp,
            move |_, comp| {
                assert_eq!(comp.result.unwrap_err(), Error::SessionReset);
                failed2.fetch_add(1, Ordering::SeqCst);
            },
            i as u64,
        )
        .unwrap();
    }

    rpc.destroy_session(sess).unwrap();
    assert_eq!(failed.load(Ordering::SeqCst), 3);
    assert!(!rpc.is_connected(sess));
    assert_eq!(rpc.destroy_session(sess).unwrap_err(), Error::Disconnected);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A connect request towards an RPC ID nobody registered is refused, and
/// queued requests fail with the remote-rejection error.
#[test]
fn refused_by_unknown_rpc_id() {
    init_logger();

    let (uri_tx, uri_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let nx = loopback_nexus(0);
        set_echo_handler(&nx);
        let rpc = Rpc::new(&nx, 2, loopback_udp(), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });

    let nx = loopback_nexus(0);
    set_echo_handler(&nx);
    let rpc = Rpc::new(&nx, 1, loopback_udp(), RpcConfig::default());

    let svr_uri: SocketAddr = uri_rx.recv().unwrap();
    // RPC 9 does not exist over there.
    let sess = rpc.create_session(svr_uri, 9).unwrap();

    let failed = Arc::new(AtomicUsize::new(0));
    let failed2 = failed.clone();
    let req = rpc.alloc_msg_buffer(8).unwrap();
    let resp = rpc.alloc_msg_buffer(8).unwrap();
    rpc.enqueue_request(
        sess,
        RPC_ECHO,
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
