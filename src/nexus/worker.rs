use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::queue::SegQueue;

use crate::handler::{HandlerTable, ReqHandle};

/// One direction of hand-off: an event loop feeding requests to a worker.
/// The reverse direction rides inside each [`ReqHandle`]'s home ring.
pub(crate) struct WorkerLane {
    pub inbound: Arc<crate::util::spsc::Spsc<ReqHandle>>,
}

/// Shared control block of one background worker.
pub(crate) struct WorkerCtl {
    /// Lanes of instances registered after the worker started.
    pub new_lanes: SegQueue<WorkerLane>,
    pub stop: AtomicBool,
}

impl WorkerCtl {
    pub fn new() -> Self {
        Self {
            new_lanes: SegQueue::new(),
            stop: AtomicBool::new(false),
        }
    }
}

/// Body of a background worker thread.
///
/// Round-robins over its lanes, executing one handler per lane per sweep.
/// Workers never touch a transport or an allocator; everything they produce
/// returns to the owning event loop through the handle's home ring.
pub(crate) fn worker_main(ctl: Arc<WorkerCtl>, handlers: Arc<HandlerTable>) {
    let mut lanes: Vec<WorkerLane> = Vec::new();

    while !ctl.stop.load(Ordering::Relaxed) {
        while let Some(lane) = ctl.new_lanes.pop() {
            lanes.push(lane);
        }

        let mut busy = false;
        lanes.retain(|lane| {
            if let Some(handle) = lane.inbound.pop() {
                busy = true;
                match handlers.get(handle.req_type()) {
                    Some(desc) => (desc.func)(handle),
                    // Dispatch checked the table; dropping sends the handle
                    // home unanswered.
                    None => drop(handle),
                }
                true
            } else {
                // Keep the lane until its instance is gone and drained.
                !(lane.inbound.is_closed() && lane.inbound.is_empty())
            }
        });

        if !busy {
            thread::sleep(Duration::from_micros(50));
        }
    }
}
