// src/channel.rs
//
// A Channel binds one file descriptor to the events it wants monitored, the
// events that last fired, and the callbacks that react to them. Channels are
// owned by their subsystem (Acceptor, Connection, TimingWheel, the loop's own
// wakeup fd); the Poller only ever holds a non-owning handle.
use crate::event_loop::EventLoop;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub type EventCallback = Box<dyn Fn() + Send + Sync>;

const EVENT_READABLE: u32 = libc::EPOLLIN as u32;
const EVENT_WRITABLE: u32 = libc::EPOLLOUT as u32;
const EVENT_ERROR: u32 = libc::EPOLLERR as u32;
const EVENT_HANGUP: u32 = libc::EPOLLHUP as u32;
const EVENT_PEER_HALF_CLOSE: u32 = libc::EPOLLRDHUP as u32;
const EVENT_PRIORITY: u32 = libc::EPOLLPRI as u32;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    error: Option<EventCallback>,
    close: Option<EventCallback>,
    // Fired on every wakeup, after the specific callbacks. Used to refresh
    // idle timers, so it must run for error and hangup wakeups too.
    any: Option<EventCallback>,
}

pub struct Channel {
    fd: i32,
    me: Weak<Channel>,
    looph: Weak<EventLoop>,
    /// Events we want the Poller to monitor.
    events: AtomicU32,
    /// Events that actually fired in the last poll round.
    revents: AtomicU32,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub fn new(looph: &Arc<EventLoop>, fd: i32) -> Arc<Channel> {
        Self::from_weak(Arc::downgrade(looph), fd)
    }

    /// Used while the owning loop itself is still under construction.
    pub(crate) fn from_weak(looph: Weak<EventLoop>, fd: i32) -> Arc<Channel> {
        Arc::new_cyclic(|me| Channel {
            fd,
            me: me.clone(),
            looph,
            events: AtomicU32::new(0),
            revents: AtomicU32::new(0),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub fn set_read_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().write = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().error = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    pub fn set_event_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().any = Some(cb);
    }

    pub fn reading(&self) -> bool {
        self.events() & EVENT_READABLE != 0
    }

    pub fn writing(&self) -> bool {
        self.events() & EVENT_WRITABLE != 0
    }

    pub fn enable_read(&self) {
        self.events.fetch_or(EVENT_READABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_read(&self) {
        self.events.fetch_and(!EVENT_READABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_write(&self) {
        self.events.fetch_or(EVENT_WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_write(&self) {
        self.events.fetch_and(!EVENT_WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(0, Ordering::Release);
        self.update();
    }

    /// Deregister from the owning loop's Poller. Must happen before the fd is
    /// closed.
    pub fn remove(&self) {
        if let (Some(lp), Some(me)) = (self.looph.upgrade(), self.me.upgrade()) {
            lp.remove_event(&me);
        }
    }

    fn update(&self) {
        if let (Some(lp), Some(me)) = (self.looph.upgrade(), self.me.upgrade()) {
            lp.update_event(&me);
        }
    }

    /// Dispatch the events recorded by the last poll round. Readable,
    /// peer-half-close and priority data all feed the read callback; an error
    /// or hangup without writability feeds the error/close callback; the
    /// any-event callback always runs last.
    pub fn handle_event(&self) {
        let revents = self.revents.load(Ordering::Acquire);
        let cbs = self.callbacks.lock().unwrap();
        if revents & (EVENT_READABLE | EVENT_PEER_HALF_CLOSE | EVENT_PRIORITY) != 0 {
            if let Some(cb) = &cbs.read {
                cb();
            }
        }
        if revents & EVENT_WRITABLE != 0 {
            if let Some(cb) = &cbs.write {
                cb();
            }
        } else if revents & EVENT_ERROR != 0 {
            if let Some(cb) = &cbs.error {
                cb();
            }
        } else if revents & EVENT_HANGUP != 0 {
            if let Some(cb) = &cbs.close {
                cb();
            }
        }
        if let Some(cb) = &cbs.any {
            cb();
        }
    }
}
