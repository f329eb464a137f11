use std::sync::mpsc;
use std::{ptr, thread};

use uddrpc::{type_alias::*, *};

fn main() {
    const RPC_HELLO: ReqType = 42;
    const HELLO_WORLD: &str = "Hello, world!";

    let (stop_tx, stop_rx) = mpsc::channel();
    let (uri_tx, uri_rx) = mpsc::channel();

    // Server thread.
    let handle = thread::spawn(move || {
        let nx = Nexus::new(("127.0.0.1", 0), 0);
        nx.register_handler(RPC_HELLO, HandlerMode::Inline, |mut req| {
            let resp = req.resp_buf();
            resp.set_len(HELLO_WORLD.len());
            unsafe {
                ptr::copy_nonoverlapping(HELLO_WORLD.as_ptr(), resp.as_ptr(), HELLO_WORLD.len())
            };
            req.respond();
        });

        let rpc = Rpc::new(&nx, 2, UdpTransport::bind(("127.0.0.1", 0)), RpcConfig::default());
        uri_tx.send(nx.uri()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });

    // Client.
    let nx = Nexus::new(("127.0.0.1", 0), 0);
    nx.register_handler(RPC_HELLO, HandlerMode::Inline, |mut req| {
        req.resp_buf().set_len(0);
        req.respond();
    });
    let rpc = Rpc::new(&nx, 1, UdpTransport::bind(("127.0.0.1", 0)), RpcConfig::default());

    let svr_uri = uri_rx.recv().unwrap();
    let sess = rpc.create_session(svr_uri, 2).unwrap();
    while !rpc.is_connected(sess) {
        rpc.run_event_loop_once();
    }

    // Send a request and print the response.
    let req = rpc.alloc_msg_buffer(16).unwrap();
    let resp = rpc.alloc_msg_buffer(64).unwrap();
    rpc.enqueue_request(
        sess,
        RPC_HELLO,
        req,
        resp,
        |_, comp| {
            let payload = unsafe { comp.resp.as_slice().to_vec() };
            println!("{}", String::from_utf8(payload).unwrap());
        },
        0,
    )
    .unwrap();
    rpc.run_event_loop(10);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}
