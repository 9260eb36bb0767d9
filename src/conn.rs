// src/conn.rs
//
// Per-connection state machine and buffered I/O, bound to exactly one
// EventLoop. Every mutation of the buffers, the channel and the parser
// context happens on the owning loop thread; calls arriving from elsewhere
// marshal through `run_in_loop`. Channel callbacks hold weak handles and
// upgrade on entry, so a released connection turns them into no-ops.
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::syscalls::Socket;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

pub type ConnRef = Arc<Connection>;
pub type ConnectedCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&ConnRef, &mut Buffer) + Send + Sync>;
pub type ClosedCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;
pub type AnyEventCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;

const READ_CHUNK: usize = 65536;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnState {
    /// Accepted but not yet wired into its loop.
    Connecting,
    /// Fully established, read monitoring on.
    Connected,
    /// Shutdown requested; pending output may still drain.
    Disconnecting,
    Disconnected,
}

#[derive(Default)]
struct UserCallbacks {
    connected: Option<ConnectedCallback>,
    message: Option<MessageCallback>,
    closed: Option<ClosedCallback>,
    any_event: Option<AnyEventCallback>,
    /// Installed by TcpServer to drop the connection from its registry. Runs
    /// after the user's closed callback.
    server_closed: Option<ClosedCallback>,
}

struct ConnInner {
    state: ConnState,
    inactive_release: bool,
    input: Buffer,
    output: Buffer,
    callbacks: UserCallbacks,
}

pub struct Connection {
    id: u64,
    me: Weak<Connection>,
    looph: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    inner: Mutex<ConnInner>,
    /// Opaque per-connection protocol state (the HTTP layer stashes its
    /// parser context here). Kept apart from `inner` so protocol code can
    /// hold it across calls back into the connection.
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Connection {
    pub fn new(looph: Arc<EventLoop>, id: u64, fd: i32) -> ConnRef {
        let conn = Arc::new_cyclic(|me: &Weak<Connection>| {
            let channel = Channel::new(&looph, fd);

            let weak = me.clone();
            channel.set_read_callback(Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.handle_read();
                }
            }));
            let weak = me.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.handle_write();
                }
            }));
            let weak = me.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.handle_close();
                }
            }));
            let weak = me.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.handle_error();
                }
            }));
            let weak = me.clone();
            channel.set_event_callback(Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.handle_any_event();
                }
            }));

            Connection {
                id,
                me: me.clone(),
                looph: looph.clone(),
                socket: Socket::new(fd),
                channel,
                inner: Mutex::new(ConnInner {
                    state: ConnState::Connecting,
                    inactive_release: false,
                    input: Buffer::new(),
                    output: Buffer::new(),
                    callbacks: UserCallbacks::default(),
                }),
                context: Mutex::new(None),
            }
        });
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> i32 {
        self.socket.fd()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().state == ConnState::Connected
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.looph
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().unwrap()
    }

    pub fn set_connected_callback(&self, cb: ConnectedCallback) {
        self.inner.lock().unwrap().callbacks.connected = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.lock().unwrap().callbacks.message = Some(cb);
    }

    pub fn set_closed_callback(&self, cb: ClosedCallback) {
        self.inner.lock().unwrap().callbacks.closed = Some(cb);
    }

    pub fn set_any_event_callback(&self, cb: AnyEventCallback) {
        self.inner.lock().unwrap().callbacks.any_event = Some(cb);
    }

    pub fn set_server_closed_callback(&self, cb: ClosedCallback) {
        self.inner.lock().unwrap().callbacks.server_closed = Some(cb);
    }

    fn conn_ref(&self) -> Option<ConnRef> {
        self.me.upgrade()
    }

    // ---- Public API; each hops to the owning loop ----

    /// Wire the freshly accepted connection into its loop: enable read
    /// monitoring and fire the user's connected callback.
    pub fn established(&self) {
        if let Some(me) = self.conn_ref() {
            self.looph.run_in_loop(move || me.established_in_loop());
        }
    }

    /// Queue bytes for delivery. The bytes are copied before the hop, so the
    /// caller's slice need not outlive it.
    pub fn send(&self, data: &[u8]) {
        let mut buf = Buffer::new();
        buf.write_and_push(data);
        if let Some(me) = self.conn_ref() {
            self.looph.run_in_loop(move || me.send_in_loop(buf));
        }
    }

    /// Half-close: deliver any unread input, let queued output drain, then
    /// release.
    pub fn shutdown(&self) {
        if let Some(me) = self.conn_ref() {
            self.looph.run_in_loop(move || me.shutdown_in_loop());
        }
    }

    /// Tear the connection down. Safe to call from any thread and from timer
    /// tasks; runs on the owning loop.
    pub fn release(&self) {
        if let Some(me) = self.conn_ref() {
            self.looph.queue_in_loop(move || me.release_in_loop());
        }
    }

    /// Arm the idle-release timer: no I/O event for `secs` seconds releases
    /// the connection. The timer id is the connection id.
    pub fn enable_inactive_release(&self, secs: u64) {
        if let Some(me) = self.conn_ref() {
            self.looph
                .run_in_loop(move || me.enable_inactive_release_in_loop(secs));
        }
    }

    pub fn cancel_inactive_release(&self) {
        if let Some(me) = self.conn_ref() {
            self.looph
                .run_in_loop(move || me.cancel_inactive_release_in_loop());
        }
    }

    /// Switch the connection to a new protocol: context and all four user
    /// callbacks are replaced in one step so no event can interleave between
    /// old and new handlers. Must already be on the owning loop, and must not
    /// be called while a `context()` guard is held.
    pub fn upgrade(
        &self,
        context: Box<dyn Any + Send>,
        connected: ConnectedCallback,
        message: MessageCallback,
        closed: ClosedCallback,
        any_event: AnyEventCallback,
    ) {
        self.looph.assert_in_loop();
        *self.context.lock().unwrap() = Some(context);
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks.connected = Some(connected);
        inner.callbacks.message = Some(message);
        inner.callbacks.closed = Some(closed);
        inner.callbacks.any_event = Some(any_event);
    }

    // ---- In-loop implementations ----

    fn established_in_loop(&self) {
        let cb = {
            let mut inner = self.inner.lock().unwrap();
            assert_eq!(inner.state, ConnState::Connecting);
            inner.state = ConnState::Connected;
            inner.callbacks.connected.clone()
        };
        self.channel.enable_read();
        if let (Some(cb), Some(me)) = (cb, self.conn_ref()) {
            cb(&me);
        }
    }

    /// Deliver unread input to the message callback. The buffer is moved out
    /// for the duration of the callback so handlers can freely call back into
    /// the connection; leftovers are put back afterwards.
    fn deliver_input(&self, cb: Option<MessageCallback>, mut input: Buffer) {
        if input.readable() > 0 {
            if let (Some(cb), Some(me)) = (cb, self.conn_ref()) {
                cb(&me, &mut input);
            }
        }
        if input.readable() > 0 {
            self.inner.lock().unwrap().input = input;
        }
    }

    fn handle_read(&self) {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match self.socket.recv_nonblocking(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                debug!(id = self.id, error = %e, "recv failed, shutting down");
                return self.shutdown_in_loop();
            }
        };
        let (cb, input) = {
            let mut inner = self.inner.lock().unwrap();
            inner.input.write_and_push(&chunk[..n]);
            if inner.input.readable() == 0 {
                return;
            }
            (
                inner.callbacks.message.clone(),
                std::mem::take(&mut inner.input),
            )
        };
        self.deliver_input(cb, input);
    }

    fn handle_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        match self.socket.send_nonblocking(inner.output.peek()) {
            Err(e) => {
                warn!(id = self.id, error = %e, "send failed, releasing");
                let cb = inner.callbacks.message.clone();
                let input = std::mem::take(&mut inner.input);
                drop(inner);
                self.deliver_input(cb, input);
                self.release();
            }
            Ok(n) => {
                inner.output.move_read_offset(n);
                if inner.output.readable() == 0 {
                    self.channel.disable_write();
                    if inner.state == ConnState::Disconnecting {
                        drop(inner);
                        self.release();
                    }
                }
            }
        }
    }

    /// The peer hung up: drain whatever input is pending, then release.
    fn handle_close(&self) {
        let (cb, input) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.callbacks.message.clone(),
                std::mem::take(&mut inner.input),
            )
        };
        self.deliver_input(cb, input);
        self.release();
    }

    fn handle_error(&self) {
        self.handle_close();
    }

    /// Runs on every wakeup, after the specific handlers: refresh the idle
    /// timer, then the user's any-event callback.
    fn handle_any_event(&self) {
        let (inactive, cb) = {
            let inner = self.inner.lock().unwrap();
            (inner.inactive_release, inner.callbacks.any_event.clone())
        };
        if inactive {
            self.looph.timer_refresh(self.id);
        }
        if let (Some(cb), Some(me)) = (cb, self.conn_ref()) {
            cb(&me);
        }
    }

    fn send_in_loop(&self, buf: Buffer) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Disconnected {
            return;
        }
        inner.output.write_and_push(buf.peek());
        if !self.channel.writing() {
            self.channel.enable_write();
        }
    }

    fn shutdown_in_loop(&self) {
        let (cb, input) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnState::Disconnecting;
            (
                inner.callbacks.message.clone(),
                std::mem::take(&mut inner.input),
            )
        };
        self.deliver_input(cb, input);
        let inner = self.inner.lock().unwrap();
        if inner.output.readable() > 0 {
            if !self.channel.writing() {
                self.channel.enable_write();
            }
        } else {
            drop(inner);
            self.release_in_loop();
        }
    }

    /// The one true teardown path: deregister before closing the fd, cancel
    /// the idle timer, then user close hook followed by the server's.
    fn release_in_loop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Disconnected {
                return;
            }
            inner.state = ConnState::Disconnected;
        }
        self.channel.remove();
        self.socket.close();
        if self.looph.has_timer(self.id) {
            self.cancel_inactive_release_in_loop();
        }
        let (closed, server_closed) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.callbacks.closed.clone(),
                inner.callbacks.server_closed.clone(),
            )
        };
        if let Some(me) = self.conn_ref() {
            if let Some(cb) = closed {
                cb(&me);
            }
            if let Some(cb) = server_closed {
                cb(&me);
            }
        }
        debug!(id = self.id, "connection released");
    }

    fn enable_inactive_release_in_loop(&self, secs: u64) {
        self.inner.lock().unwrap().inactive_release = true;
        if self.looph.has_timer(self.id) {
            return self.looph.timer_refresh(self.id);
        }
        let weak = self.me.clone();
        self.looph.timer_add(
            self.id,
            secs,
            Box::new(move || {
                if let Some(c) = weak.upgrade() {
                    c.release();
                }
            }),
        );
    }

    fn cancel_inactive_release_in_loop(&self) {
        self.inner.lock().unwrap().inactive_release = false;
        if self.looph.has_timer(self.id) {
            self.looph.timer_cancel(self.id);
        }
    }
}
