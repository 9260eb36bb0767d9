// src/loop_pool.rs
//
// Worker-loop pool: N threads, each running its own EventLoop. The loop is
// constructed on the worker's stack and published under a mutex + condvar so
// `get_loop` can never observe it before construction finishes.
use crate::event_loop::EventLoop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::info;

struct LoopSlot {
    slot: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
}

pub struct LoopThread {
    shared: Arc<LoopSlot>,
    _thread: thread::JoinHandle<()>,
}

impl LoopThread {
    pub fn new() -> LoopThread {
        let shared = Arc::new(LoopSlot {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        let published = shared.clone();
        let handle = thread::Builder::new()
            .name("millrace-loop".to_string())
            .spawn(move || {
                let lp = EventLoop::new();
                {
                    let mut slot = published.slot.lock().unwrap();
                    *slot = Some(lp.clone());
                    published.ready.notify_all();
                }
                lp.start();
            })
            .expect("failed to spawn loop thread");
        LoopThread {
            shared,
            _thread: handle,
        }
    }

    /// Block until the worker has published its loop.
    pub fn get_loop(&self) -> Arc<EventLoop> {
        let mut slot = self.shared.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.ready.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }
}

impl Default for LoopThread {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopThreadPool {
    thread_count: AtomicUsize,
    next_idx: AtomicUsize,
    base: Arc<EventLoop>,
    threads: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl LoopThreadPool {
    pub fn new(base: Arc<EventLoop>) -> Self {
        Self {
            thread_count: AtomicUsize::new(0),
            next_idx: AtomicUsize::new(0),
            base,
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_thread_count(&self, count: usize) {
        self.thread_count.store(count, Ordering::Release);
    }

    /// Spawn the worker threads and wait for each loop to come up.
    pub fn create(&self) {
        let count = self.thread_count.load(Ordering::Acquire);
        if count == 0 {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for _ in 0..count {
            let lt = LoopThread::new();
            loops.push(lt.get_loop());
            threads.push(lt);
        }
        info!(workers = count, "loop pool started");
    }

    /// Round-robin over the workers; with no workers every connection shares
    /// the base loop.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let count = self.thread_count.load(Ordering::Acquire);
        if count == 0 {
            return self.base.clone();
        }
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % count;
        self.loops.lock().unwrap()[idx].clone()
    }
}
