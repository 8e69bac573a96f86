//! Modbus side of the bridge: transports, framing, the request engine and the
//! cancellable loop that drives a session.
pub mod cancel;
pub mod engine;
pub mod framing;
pub mod link;
pub mod request_loop;
pub mod session;
pub mod timeout;

pub use cancel::CancelToken;
pub use engine::{Engine, Indication};
pub use framing::Framing;
pub use link::{Link, LinkKind, Parity, SerialLink, SerialMode, SerialParams, TcpAcceptor, TcpLink};
pub use request_loop::{run_request_loop, LoopOutcome};
pub use session::{ServiceOutcome, SessionState, TransportSession};
pub use timeout::Timeout;

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        io::{self, Read, Write},
        os::fd::RawFd,
        sync::Arc,
        time::Duration,
    };

    use parking_lot::Mutex;

    use super::link::{Link, LinkKind};

    /// In-memory link fed with scripted read results.
    pub(crate) struct MockLink {
        incoming: VecDeque<io::Result<Vec<u8>>>,
        closing: bool,
        write_error: Option<io::ErrorKind>,
        timeout: Duration,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl MockLink {
        pub(crate) fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                incoming: chunks.into_iter().map(Ok).collect(),
                closing: false,
                write_error: None,
                timeout: Duration::from_millis(100),
                output: Arc::default(),
            }
        }

        pub(crate) fn failing(err: io::Error) -> Self {
            let mut link = Self::new(vec![]);
            link.incoming.push_back(Err(err));
            link
        }

        /// Report end of stream once the script is used up.
        pub(crate) fn closing(mut self) -> Self {
            self.closing = true;
            self
        }

        /// Fail every write with `kind`.
        pub(crate) fn rejecting_writes(mut self, kind: io::ErrorKind) -> Self {
            self.write_error = Some(kind);
            self
        }

        pub(crate) fn output(&self) -> Arc<Mutex<Vec<u8>>> {
            self.output.clone()
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.output.lock().clone()
        }
    }

    impl Read for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.pop_front() {
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.incoming.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
                None if self.closing => Ok(0),
                None => {
                    std::thread::sleep(self.timeout);
                    Err(io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    impl Write for MockLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            self.output.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for MockLink {
        fn kind(&self) -> LinkKind {
            LinkKind::Serial
        }

        fn raw_handle(&self) -> RawFd {
            -1
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.timeout = timeout;
            Ok(())
        }
    }
}
