// src/acceptor.rs
//
// Listening socket plus its Channel on the base loop. The accept callback
// must be installed before `listen` enables read monitoring; enabling first
// would let a connection arrive with no handler to take it.
use crate::channel::Channel;
use crate::error::MillResult;
use crate::event_loop::EventLoop;
use crate::syscalls;
use std::sync::Arc;
use tracing::{error, info};

pub type AcceptCallback = Box<dyn Fn(i32) + Send + Sync>;

pub struct Acceptor {
    listen_fd: i32,
    channel: Arc<Channel>,
}

impl Acceptor {
    pub fn new(looph: &Arc<EventLoop>, port: u16) -> MillResult<Acceptor> {
        let listen_fd = syscalls::create_listen_socket(port)?;
        let channel = Channel::new(looph, listen_fd);
        info!(port, listen_fd, "listening");
        Ok(Acceptor { listen_fd, channel })
    }

    /// Accepts once per readable wakeup and hands the fresh fd to `cb`.
    pub fn set_accept_callback(&self, cb: AcceptCallback) {
        let listen_fd = self.listen_fd;
        self.channel.set_read_callback(Box::new(move || {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => cb(fd),
                Ok(None) => {}
                Err(e) => error!(error = %e, "accept failed"),
            }
        }));
    }

    /// Enable read monitoring on the listener.
    pub fn listen(&self) {
        self.channel.enable_read();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.remove();
        syscalls::close_fd(self.listen_fd);
    }
}
