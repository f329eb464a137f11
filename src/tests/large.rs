//! Multi-packet request and response tests.

use super::*;

const RPC_SINK: ReqType = 50;
const RPC_SOURCE: ReqType = 51;
const RPC_MIRROR: ReqType = 52;

/// 1024 payload bytes per packet.
fn small_mtu() -> UdpConfig {
    UdpConfig {
        mtu: 1024 + 16,
        ..Default::default()
    }
}

fn set_handlers(nx: &Nexus) {
    // Sink: verify a patterned request, answer with its length.
    nx.register_handler(RPC_SINK, HandlerMode::Inline, |mut req| {
        let data = payload_of(req.req_buf());
        assert!(
            data.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8),
            "reassembled request is not contiguous and bit-identical"
        );
        let resp = req.resp_buf();
        resp.set_len(8);
        unsafe { resp.as_mut_slice().copy_from_slice(&(data.len() as u64).to_le_bytes()) };
        req.respond();
    });

    // Source: answer a small request with a patterned response of the
    // requested size.
    nx.register_handler(RPC_SOURCE, HandlerMode::Inline, |mut req| {
        let want = u64::from_le_bytes(payload_of(req.req_buf()).try_into().unwrap()) as usize;
        let mut resp = Rpc::<UdpTransport>::with_current(|rpc| {
            rpc.alloc_msg_buffer(want).unwrap()
        })
        .expect("source handler must run on the event-loop thread");
        unsafe {
            for (i, b) in resp.as_mut_slice().iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        req.set_dyn_resp(resp);
        req.respond();
    });

    // Mirror: echo a large request back in full.
    nx.register_handler(RPC_MIRROR, HandlerMode::Inline, |mut req| {
        let data = payload_of(req.req_buf());
        let mut resp = Rpc::<UdpTransport>::with_current(|rpc| {
            rpc.alloc_msg_buffer(data.len()).unwrap()
        })
        .expect("mirror handler must run on the event-loop thread");
        unsafe { resp.as_mut_slice().copy_from_slice(&data) };
        req.set_dyn_resp(resp);
        req.respond();
    });
}

fn spawn_server() -> (SocketAddr, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (stop_tx, stop_rx) = mpsc::channel();
    let (uri_tx, uri_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx = loopback_nexus(0);
        set_handlers(&nx);
        let rpc = Rpc::new(&nx, 2, loopback_udp_with(small_mtu()), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });
    (uri_rx.recv().unwrap(), stop_tx, handle)
}

/// Scenario: a 4096-byte request at a 1024-byte payload MTU travels as four
/// data packets, gated by one explicit credit return after the first.
#[test]
fn multi_packet_request() {
    init_logger();
    let (svr_uri, stop, handle) = spawn_server();

    let nx = loopback_nexus(0);
    set_handlers(&nx);
    let rpc = Rpc::new(&nx, 1, loopback_udp_with(small_mtu()), RpcConfig::default());

    let sess = rpc.create_session(svr_uri, 2).unwrap();
    connect_or_die(&rpc, sess);

    let mut req = rpc.alloc_msg_buffer(4096).unwrap();
    unsafe {
        for (i, b) in req.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }
    let resp = rpc.alloc_msg_buffer(8).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    rpc.enqueue_request(
        sess,
        RPC_SINK,
        req,
        resp,
        move |_, comp| {
            assert!(comp.result.is_ok());
            let echoed = u64::from_le_bytes(payload_of(&comp.resp).try_into().unwrap());
            assert_eq!(echoed, 4096);
            done2.fetch_add(1, Ordering::SeqCst);
        },
        0,
    )
    .unwrap();

    assert!(spin_until(&rpc, Duration::from_secs(5), || done
        .load(Ordering::SeqCst)
        == 1));

    let stats = rpc.stats();
    assert!(stats.rx_cr >= 1, "no credit return observed");
    if stats.retransmits == 0 {
        assert_eq!(stats.tx_data, 4, "expected exactly four data packets");
    }

    stop.send(()).unwrap();
    handle.join().unwrap();
}

/// A multi-packet response is pulled segment by segment with RFRs.
#[test]
fn multi_packet_response() {
    init_logger();
    let (svr_uri, stop, handle) = spawn_server();

    let nx = loopback_nexus(0);
    set_handlers(&nx);
    let rpc = Rpc::new(&nx, 1, loopback_udp_with(small_mtu()), RpcConfig::default());

    let sess = rpc.create_session(svr_uri, 2).unwrap();
    connect_or_die(&rpc, sess);

    const RESP_LEN: usize = 4096;
    let mut req = rpc.alloc_msg_buffer(8).unwrap();
    unsafe {
        req.as_mut_slice()
            .copy_from_slice(&(RESP_LEN as u64).to_le_bytes())
    };
    let resp = rpc.alloc_msg_buffer(RESP_LEN).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    rpc.enqueue_request(
        sess,
        RPC_SOURCE,
        req,
        resp,
        move |_, comp| {
            assert!(comp.result.is_ok());
            assert_eq!(comp.resp.len(), RESP_LEN);
            let data = payload_of(&comp.resp);
            assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
            done2.fetch_add(1, Ordering::SeqCst);
        },
        0,
    )
    .unwrap();

    assert!(spin_until(&rpc, Duration::from_secs(5), || done
        .load(Ordering::SeqCst)
        == 1));
    assert!(rpc.stats().tx_rfr >= 3, "response segments were not pulled");

    stop.send(()).unwrap();
    handle.join().unwrap();
}

/// Large payloads both ways, repeated, with slot reuse in between.
#[test]
fn large_both_ways() {
    init_logger();
    let (svr_uri, stop, handle) = spawn_server();

    let nx = loopback_nexus(0);
    set_handlers(&nx);
    let rpc = Rpc::new(&nx, 1, loopback_udp_with(small_mtu()), RpcConfig::default());

    let sess = rpc.create_session(svr_uri, 2).unwrap();
    connect_or_die(&rpc, sess);

    const LEN: usize = 8192;
    let done = Arc::new(AtomicUsize::new(0));
    for round in 0..10usize {
        let mut req = rpc.alloc_msg_buffer(LEN).unwrap();
        unsafe {
            for (i, b) in req.as_mut_slice().iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        let resp = rpc.alloc_msg_buffer(LEN).unwrap();

        let done2 = done.clone();
        rpc.enqueue_request(
            sess,
            RPC_MIRROR,
            req,
            resp,
            move |_, comp| {
                assert!(comp.result.is_ok());
                assert_eq!(comp.resp.len(), LEN);
                let data = payload_of(&comp.resp);
                assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
                done2.fetch_add(1, Ordering::SeqCst);
            },
            round as u64,
        )
        .unwrap();

        assert!(spin_until(&rpc, Duration::from_secs(10), || done
            .load(Ordering::SeqCst)
            == round + 1));
    }

    stop.send(()).unwrap();
    handle.join().unwrap();
}
