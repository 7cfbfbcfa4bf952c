//! The single cooperative worker loop.
//!
//! One thread per process drains the per-host queues on a fixed heartbeat:
//! reducer first, then hub dispatch, then a budgeted GC pass. A storage
//! rotation marker, once due, forces a full retention recomputation before
//! the normal drains.

pub(crate) mod dispatch;
pub(crate) mod gc;
pub(crate) mod post_process;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::clock::now_us;
use crate::index::ContextIndex;
use crate::registry::flags::flag;

enum WorkerMessage {
    Tick,
    Shutdown,
}

/// Handle to the spawned worker thread; shutting it down (or dropping it)
/// finishes in-flight work and drains the post-processing queues once
/// more, so in-memory state is consistent with the last hook. Outstanding
/// hub-queue items are abandoned; the shadow replays them at next startup.
pub struct WorkerHandle {
    sender: Sender<WorkerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Requests an immediate tick, ahead of the heartbeat.
    pub fn trigger(&self) {
        let _ = self.sender.send(WorkerMessage::Tick);
    }

    /// Stops the loop and joins the thread.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ContextIndex {
    /// Spawns the worker loop over this index.
    pub fn spawn_worker(self: &Arc<Self>) -> WorkerHandle {
        let (sender, receiver) = mpsc::channel();
        let index = Arc::clone(self);
        let thread = thread::spawn(move || worker_loop(index, receiver));
        WorkerHandle { sender, thread: Some(thread) }
    }

    /// One full worker tick: rotation handling, then per-host queue drains
    /// and a budgeted GC pass. Exposed so tests can drive time explicitly.
    pub fn run_tick(&self, now_us: u64) {
        if self.take_due_rotation(now_us) {
            info!("worker.rotation.rescan");
            for host in self.hosts_snapshot() {
                self.recalculate_host_retention(&host, flag::STORAGE_ROTATION);
            }
        }

        let mut gc_budget = Some(self.config().gc_max_rows_per_pass);
        for host in self.hosts_snapshot() {
            post_process::post_process_queued(self, &host);
            dispatch::dispatch_queued(self, &host, now_us);
            gc::garbage_collect_host(self, &host, &mut gc_budget);
        }
    }
}

fn worker_loop(index: Arc<ContextIndex>, receiver: Receiver<WorkerMessage>) {
    info!("worker.started");

    loop {
        match receiver.recv_timeout(index.config().heartbeat) {
            Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(WorkerMessage::Tick) | Err(RecvTimeoutError::Timeout) => {
                index.run_tick(now_us());
            }
        }
    }

    // final reducer drain, so restart resumes from a consistent tree
    for host in index.hosts_snapshot() {
        post_process::post_process_queued(&index, &host);
    }

    info!("worker.stopped");
}
