// src/server.rs
//
// TcpServer composes the Acceptor on the base loop, the worker-loop pool and
// the connection registry. The registry is only touched from the base loop;
// close hooks arriving from worker loops hop back before erasing.
use crate::acceptor::Acceptor;
use crate::conn::{
    AnyEventCallback, ClosedCallback, ConnRef, ConnectedCallback, Connection, MessageCallback,
};
use crate::error::MillResult;
use crate::event_loop::EventLoop;
use crate::loop_pool::LoopThreadPool;
use crate::syscalls;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[derive(Default)]
struct ServerCallbacks {
    connected: Option<ConnectedCallback>,
    message: Option<MessageCallback>,
    closed: Option<ClosedCallback>,
    any_event: Option<AnyEventCallback>,
}

pub struct TcpServer {
    me: Weak<TcpServer>,
    next_id: AtomicU64,
    timeout: AtomicU64,
    enable_inactive: AtomicBool,
    base_loop: Arc<EventLoop>,
    acceptor: Acceptor,
    pool: LoopThreadPool,
    conns: Mutex<HashMap<u64, ConnRef>>,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    pub fn new(port: u16) -> MillResult<Arc<TcpServer>> {
        syscalls::ignore_sigpipe();
        let base_loop = EventLoop::new();
        let acceptor = Acceptor::new(&base_loop, port)?;
        let pool = LoopThreadPool::new(base_loop.clone());
        let server = Arc::new_cyclic(|me: &Weak<TcpServer>| TcpServer {
            me: me.clone(),
            next_id: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            enable_inactive: AtomicBool::new(false),
            base_loop,
            acceptor,
            pool,
            conns: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });
        // The handler must be in place before listen enables read monitoring,
        // or an early connection could be accepted with nobody to take it.
        let weak = Arc::downgrade(&server);
        server.acceptor.set_accept_callback(Box::new(move |fd| {
            if let Some(srv) = weak.upgrade() {
                srv.new_connection(fd);
            }
        }));
        server.acceptor.listen();
        Ok(server)
    }

    pub fn set_thread_count(&self, count: usize) {
        self.pool.set_thread_count(count);
    }

    pub fn set_connected_callback(&self, cb: ConnectedCallback) {
        self.callbacks.lock().unwrap().connected = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_closed_callback(&self, cb: ClosedCallback) {
        self.callbacks.lock().unwrap().closed = Some(cb);
    }

    pub fn set_any_event_callback(&self, cb: AnyEventCallback) {
        self.callbacks.lock().unwrap().any_event = Some(cb);
    }

    /// Release connections that produce no I/O event for `timeout_secs`
    /// (1..=60) seconds.
    pub fn enable_inactive_release(&self, timeout_secs: u64) {
        self.timeout.store(timeout_secs, Ordering::Release);
        self.enable_inactive.store(true, Ordering::Release);
    }

    /// Schedule a one-shot task on the base loop, `delay` seconds out.
    pub fn run_after<F>(&self, task: F, delay: u64)
    where
        F: FnOnce() + Send + 'static,
    {
        let weak = self.me.clone();
        self.base_loop.run_in_loop(move || {
            if let Some(srv) = weak.upgrade() {
                let id = srv.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                srv.base_loop.timer_add(id, delay, Box::new(task));
            }
        });
    }

    /// Spawn the worker pool and run the base loop. Never returns.
    pub fn start(&self) {
        self.pool.create();
        self.base_loop.start();
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn new_connection(&self, fd: i32) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::new(self.pool.next_loop(), id, fd);
        {
            let cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = &cbs.connected {
                conn.set_connected_callback(cb.clone());
            }
            if let Some(cb) = &cbs.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &cbs.closed {
                conn.set_closed_callback(cb.clone());
            }
            if let Some(cb) = &cbs.any_event {
                conn.set_any_event_callback(cb.clone());
            }
        }
        let weak = self.me.clone();
        conn.set_server_closed_callback(Arc::new(move |c: &ConnRef| {
            if let Some(srv) = weak.upgrade() {
                srv.remove_connection(c);
            }
        }));
        if self.enable_inactive.load(Ordering::Acquire) {
            conn.enable_inactive_release(self.timeout.load(Ordering::Acquire));
        }
        conn.established();
        self.conns.lock().unwrap().insert(id, conn);
        debug!(id, fd, "accepted connection");
    }

    fn remove_connection(&self, conn: &ConnRef) {
        let id = conn.id();
        let weak = self.me.clone();
        self.base_loop.run_in_loop(move || {
            if let Some(srv) = weak.upgrade() {
                srv.conns.lock().unwrap().remove(&id);
            }
        });
    }
}
