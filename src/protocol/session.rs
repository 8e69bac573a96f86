use std::os::fd::RawFd;

use super::{
    cancel::CancelToken,
    engine::{Engine, Indication},
    framing::Framing,
    link::{Link, SerialLink, SerialParams, TcpAcceptor},
    timeout::Timeout,
};
use crate::{
    error::{BridgeError, BridgeResult},
    store::RegisterMapping,
    sync::AccessGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    RequestHandled,
    /// The master went away; the session is closed.
    ConnectionClosed,
    /// A termination request woke the receive.
    Interrupted,
}

/// One connected endpoint bound to the register mapping it serves.
pub struct TransportSession<'m> {
    link: Box<dyn Link>,
    engine: Engine,
    mapping: RegisterMapping<'m>,
    guard: Option<AccessGuard>,
    cancel: CancelToken,
    state: SessionState,
}

impl<'m> TransportSession<'m> {
    /// Wrap an already connected link.
    pub fn from_link(
        link: Box<dyn Link>,
        framing: Framing,
        mapping: RegisterMapping<'m>,
        cancel: CancelToken,
    ) -> Self {
        if let Some(fd) = link.shutdown_handle() {
            cancel.arm(fd);
        }
        log::info!("Connected to bus.");
        Self {
            link,
            engine: Engine::new(framing),
            mapping,
            guard: None,
            cancel,
            state: SessionState::Connected,
        }
    }

    pub fn connect_rtu(
        params: &SerialParams,
        unit_id: u8,
        mapping: RegisterMapping<'m>,
        cancel: CancelToken,
    ) -> BridgeResult<Self> {
        if unit_id > 247 {
            return Err(BridgeError::config(format!(
                "unit id {unit_id} is outside 0..=247"
            )));
        }
        log::debug!("Connecting to {}", params.device);
        let link = SerialLink::open(params)?;
        Ok(Self::from_link(
            Box::new(link),
            Framing::Rtu { unit_id },
            mapping,
            cancel,
        ))
    }

    /// Wait for the single master connection. `Ok(None)` when cancelled first.
    pub fn accept_tcp(
        acceptor: TcpAcceptor,
        mapping: RegisterMapping<'m>,
        cancel: CancelToken,
    ) -> BridgeResult<Option<Self>> {
        let Some(link) = acceptor.accept(&cancel)? else {
            return Ok(None);
        };
        Ok(Some(Self::from_link(
            Box::new(link),
            Framing::Tcp,
            mapping,
            cancel,
        )))
    }

    /// Serialise every reply with `guard`. Its counters start from zero.
    pub fn enable_guard(&mut self, mut guard: AccessGuard) -> BridgeResult<()> {
        if let Some(current) = &self.guard {
            return Err(BridgeError::config(format!(
                "session is already guarded by '{}'",
                current.name()
            )));
        }
        guard.reset();
        self.guard = Some(guard);
        Ok(())
    }

    pub fn guard(&self) -> Option<&AccessGuard> {
        self.guard.as_ref()
    }

    /// Each timeout left as `None` keeps its current value. A zero byte
    /// timeout removes the bound between bytes.
    pub fn set_timeouts(
        &mut self,
        byte_timeout: Option<f64>,
        response_timeout: Option<f64>,
    ) -> BridgeResult<()> {
        let byte_timeout = byte_timeout.map(Timeout::from_secs_f64).transpose()?;
        let response_timeout = response_timeout.map(Timeout::from_secs_f64).transpose()?;
        if let Some(timeout) = response_timeout {
            if timeout.is_zero() {
                return Err(BridgeError::config("response timeout must be positive"));
            }
            self.engine.set_response_timeout(Some(timeout));
        }
        if let Some(timeout) = byte_timeout {
            self.engine.set_byte_timeout(Some(timeout));
        }
        Ok(())
    }

    pub fn byte_timeout(&self) -> Option<Timeout> {
        self.engine.byte_timeout()
    }

    pub fn response_timeout(&self) -> Option<Timeout> {
        self.engine.response_timeout()
    }

    pub fn set_monitor(&mut self, monitor: bool) {
        self.engine.set_monitor(monitor);
    }

    pub fn raw_handle(&self) -> RawFd {
        self.link.raw_handle()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that interrupts this session's blocking receive.
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Receive one request and answer it inside the guarded section.
    pub fn service_one_request(&mut self) -> BridgeResult<ServiceOutcome> {
        if self.state != SessionState::Connected {
            return Err(BridgeError::protocol(format!(
                "cannot service requests while {:?}",
                self.state
            )));
        }

        let request = match self.engine.receive(self.link.as_mut(), &self.cancel) {
            Ok(Indication::Request(request)) => request,
            Ok(Indication::ConnectionReset) => {
                self.state = SessionState::Closed;
                return Ok(ServiceOutcome::ConnectionClosed);
            }
            Ok(Indication::Interrupted) => return Ok(ServiceOutcome::Interrupted),
            Err(err) => {
                self.state = SessionState::Closed;
                return Err(err);
            }
        };

        if let Some(guard) = &mut self.guard {
            // A miss below the ceiling still replies, unguarded.
            guard.acquire()?;
        }
        let replied = self
            .engine
            .reply(self.link.as_mut(), &request, &mut self.mapping);
        let released = match &mut self.guard {
            Some(guard) => guard.release(),
            None => Ok(()),
        };
        replied?;
        released?;
        Ok(ServiceOutcome::RequestHandled)
    }
}

impl Drop for TransportSession<'_> {
    fn drop(&mut self) {
        // The link closes right after this; cancel must not touch a reused fd.
        self.cancel.disarm();
    }
}
