// src/poller.rs
//
// Readiness demultiplexer. Maintains the invariant that every registered fd
// maps to exactly one Channel; the map holds weak handles only, ownership
// stays with the Channel's subsystem.
use crate::channel::Channel;
use crate::syscalls::Epoll;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

const MAX_EPOLL_EVENTS: usize = 1024;

pub struct Poller {
    epoll: Epoll,
    channels: Mutex<HashMap<i32, Weak<Channel>>>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            epoll: Epoll::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new channel or reconcile an existing registration with its
    /// current wanted-event mask.
    pub fn update_event(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut channels = self.channels.lock().unwrap();
        let ret = if channels.contains_key(&fd) {
            self.epoll.modify(fd, channel.events())
        } else {
            channels.insert(fd, Arc::downgrade(channel));
            self.epoll.add(fd, channel.events())
        };
        if let Err(e) = ret {
            error!(fd, error = %e, "epoll_ctl failed");
        }
    }

    /// Deregister; after this the fd never appears in a poll result again.
    pub fn remove_event(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.lock().unwrap().remove(&fd);
        if let Err(e) = self.epoll.delete(fd) {
            error!(fd, error = %e, "epoll_ctl delete failed");
        }
    }

    /// Block until readiness and return the channels that fired, with their
    /// fired-event masks recorded. EINTR yields an empty round; any other
    /// poll failure is fatal.
    pub fn poll(&self) -> Vec<Arc<Channel>> {
        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { std::mem::zeroed() };
        let n = match self.epoll.wait(&mut events, -1) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "epoll_wait failed");
                std::process::abort();
            }
        };
        let channels = self.channels.lock().unwrap();
        let mut actives = Vec::with_capacity(n);
        for event in &events[..n] {
            let fd = event.u64 as i32;
            if let Some(channel) = channels.get(&fd).and_then(Weak::upgrade) {
                channel.set_revents(event.events);
                actives.push(channel);
            }
        }
        actives
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
