//! Out-of-band termination of a blocked request loop.
//!
//! A [`CancelToken`] is shared between the loop and whatever receives the
//! termination notice (a signal handler, a test thread). Cancelling records
//! the request first and then shuts down the handle currently armed, which
//! wakes a receive or accept that is blocked inside the kernel. Readers that
//! cannot be shut down this way poll [`CancelToken::is_cancelled`] between
//! bounded waits.
use std::{
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    armed: Mutex<Option<RawFd>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let armed = self.inner.armed.lock();
        if let Some(fd) = *armed {
            // The handle stays open; its owner closes it when it unwinds.
            if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } != 0 {
                log::debug!(
                    "shutdown of handle {fd} failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register the socket a blocking call is about to wait on.
    ///
    /// Returns `false` when cancellation already happened; the caller must not
    /// block then.
    pub fn arm(&self, fd: RawFd) -> bool {
        let mut armed = self.inner.armed.lock();
        *armed = Some(fd);
        !self.is_cancelled()
    }

    /// Forget the armed handle. Must run before that handle is closed.
    pub fn disarm(&self) {
        *self.inner.armed.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Read,
        net::{TcpListener, TcpStream},
        os::fd::AsRawFd,
        thread,
        time::Duration,
    };

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        assert!(!other.arm(0));
        other.disarm();
    }

    #[test]
    fn cancel_wakes_a_blocked_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let token = CancelToken::new();
        assert!(token.arm(server.as_raw_fd()));

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let mut buf = [0u8; 8];
        let read = server.read(&mut buf).unwrap();
        assert_eq!(read, 0);
        assert!(token.is_cancelled());
        token.disarm();
        handle.join().unwrap();
    }
}
