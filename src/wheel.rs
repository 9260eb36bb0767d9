// src/wheel.rs
//
// Hashed timing wheel: 60 one-second slots advanced by a periodic timerfd.
// A timer lives as long as at least one slot holds a strong reference to it;
// refreshing pushes a second strong reference into a later slot, so expiry of
// the original slot no longer releases it. When the last reference drops the
// task fires unless the timer was canceled, and the release hook always
// erases the timer from the id index.
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::syscalls;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub const WHEEL_CAPACITY: usize = 60;

pub type TimerTask = Box<dyn FnOnce() + Send>;

pub struct Timer {
    id: u64,
    delay: u64,
    canceled: AtomicBool,
    task: Mutex<Option<TimerTask>>,
    wheel: Weak<Mutex<WheelInner>>,
}

impl Timer {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn delay(&self) -> u64 {
        self.delay
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.canceled.load(Ordering::Acquire) {
            if let Some(task) = self.task.lock().unwrap().take() {
                task();
            }
        }
        if let Some(wheel) = self.wheel.upgrade() {
            wheel.lock().unwrap().timers.remove(&self.id);
        }
    }
}

struct WheelInner {
    tick: usize,
    slots: Vec<Vec<Arc<Timer>>>,
    timers: HashMap<u64, Weak<Timer>>,
}

pub struct TimingWheel {
    timer_fd: i32,
    channel: Arc<Channel>,
    inner: Arc<Mutex<WheelInner>>,
}

impl TimingWheel {
    pub(crate) fn new(looph: Weak<EventLoop>) -> Self {
        let timer_fd = syscalls::create_timer_fd();
        let inner = Arc::new(Mutex::new(WheelInner {
            tick: 0,
            slots: vec![Vec::new(); WHEEL_CAPACITY],
            timers: HashMap::new(),
        }));
        let channel = Channel::from_weak(looph, timer_fd);
        let wheel = inner.clone();
        channel.set_read_callback(Box::new(move || {
            let times = syscalls::read_timer_fd(timer_fd);
            for _ in 0..times {
                // Timers must not drop while the wheel is locked: their drop
                // hook re-enters the lock to erase the id index.
                let expired = {
                    let mut inner = wheel.lock().unwrap();
                    inner.tick = (inner.tick + 1) % WHEEL_CAPACITY;
                    let tick = inner.tick;
                    std::mem::take(&mut inner.slots[tick])
                };
                drop(expired);
            }
        }));
        Self {
            timer_fd,
            channel,
            inner,
        }
    }

    /// Start monitoring the timerfd. Called once the owning loop's Arc is
    /// established.
    pub(crate) fn activate(&self) {
        self.channel.enable_read();
    }

    /// Schedule `cb` to fire `delay` seconds from now. Contract:
    /// `0 < delay <= WHEEL_CAPACITY`.
    pub(crate) fn add_in_loop(&self, id: u64, delay: u64, cb: TimerTask) {
        debug_assert!(delay >= 1 && delay as usize <= WHEEL_CAPACITY);
        let timer = Arc::new(Timer {
            id,
            delay,
            canceled: AtomicBool::new(false),
            task: Mutex::new(Some(cb)),
            wheel: Arc::downgrade(&self.inner),
        });
        let mut inner = self.inner.lock().unwrap();
        let pos = (inner.tick + delay as usize) % WHEEL_CAPACITY;
        inner.timers.insert(id, Arc::downgrade(&timer));
        inner.slots[pos].push(timer);
    }

    /// Push the timer one full delay into the future. O(1): the stale slot
    /// entry expires harmlessly because this one outlives it.
    pub(crate) fn refresh_in_loop(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let timer = match inner.timers.get(&id).and_then(Weak::upgrade) {
            Some(t) => t,
            None => return,
        };
        let pos = (inner.tick + timer.delay() as usize) % WHEEL_CAPACITY;
        inner.slots[pos].push(timer);
    }

    /// Flag the timer so its task never runs. The slot entries drain on their
    /// own as the wheel turns. Canceling an id whose timer is already being
    /// dropped is a no-op.
    pub(crate) fn cancel_in_loop(&self, id: u64) {
        let inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timers.get(&id).and_then(Weak::upgrade) {
            timer.cancel();
        }
    }

    pub(crate) fn has_timer(&self, id: u64) -> bool {
        self.inner.lock().unwrap().timers.contains_key(&id)
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        syscalls::close_fd(self.timer_fd);
    }
}
