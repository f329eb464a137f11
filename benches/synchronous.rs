use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::{ptr, thread};

use criterion::{criterion_group, criterion_main, Criterion};
use uddrpc::{type_alias::*, *};

const RPC_SMALL: ReqType = 42;
const SMALL_RPC_LEN: usize = 8;

fn register(nx: &Nexus) {
    nx.register_handler(RPC_SMALL, HandlerMode::Inline, |mut req| {
        let resp = req.resp_buf();
        resp.set_len(SMALL_RPC_LEN);
        unsafe { ptr::write_bytes(resp.as_ptr(), 1, SMALL_RPC_LEN) };
        req.respond();
    });
}

pub fn benchmark_idle(c: &mut Criterion) {
    let nx = Nexus::new(("127.0.0.1", 0), 0);
    register(&nx);
    let rpc = Rpc::new(&nx, 1, UdpTransport::bind(("127.0.0.1", 0)), RpcConfig::default());

    // Idle event-loop latency.
    c.bench_function("idle-eventloop", |b| b.iter(|| rpc.run_event_loop_once()));
}

pub fn benchmark_sync(c: &mut Criterion) {
    let (stop_tx, stop_rx) = mpsc::channel();
    let (uri_tx, uri_rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx = Nexus::new(("127.0.0.1", 0), 0);
        register(&nx);
        let rpc = Rpc::new(&nx, 2, UdpTransport::bind(("127.0.0.1", 0)), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });

    let nx = Nexus::new(("127.0.0.1", 0), 0);
    register(&nx);
    let rpc = Rpc::new(&nx, 1, UdpTransport::bind(("127.0.0.1", 0)), RpcConfig::default());

    let svr_uri = uri_rx.recv().unwrap();
    let sess = rpc.create_session(svr_uri, 2).unwrap();
    while !rpc.is_connected(sess) {
        rpc.run_event_loop_once();
    }

    let done = Arc::new(AtomicUsize::new(0));
    c.bench_function("rpc-small-sync", |b| {
        b.iter(|| {
            let req = rpc.alloc_msg_buffer(SMALL_RPC_LEN).unwrap();
            let resp = rpc.alloc_msg_buffer(SMALL_RPC_LEN).unwrap();
            let before = done.load(Ordering::Relaxed);
            let done2 = done.clone();
            rpc.enqueue_request(
                sess,
                RPC_SMALL,
                req,
                resp,
                move |_, comp| {
                    assert!(comp.result.is_ok());
                    done2.fetch_add(1, Ordering::Relaxed);
                },
                0,
            )
            .unwrap();
            while done.load(Ordering::Relaxed) == before {
                rpc.run_event_loop_once();
            }
        })
    });

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

criterion_group!(benches, benchmark_idle, benchmark_sync);
criterion_main!(benches);
