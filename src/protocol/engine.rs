//! Receive one indication and reply into the register mapping.
//!
//! Frame parsing, request processing and response encoding are done by
//! `rmodbus`. Its storage is only a mirror: before processing, the window a
//! request addresses is copied in from the shared banks, and for writes the
//! window is copied back out afterwards. Requests are validated against the
//! real bank capacities first, so the mirror never sees an address the
//! shared memory does not have.
use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use rmodbus::{
    consts::ModbusErrorCode,
    server::{context::ModbusContext, storage::ModbusStorage, ModbusFrame},
};

use super::{cancel::CancelToken, framing::Framing, link::Link, timeout::Timeout};
use crate::{
    error::{BridgeError, BridgeResult},
    store::{BankKind, RegisterMapping, MAX_CAPACITY},
};

/// Longest single wait on the link, so cancellation is noticed promptly
/// even on handles that cannot be shut down.
pub const POLL_SLICE: Duration = Duration::from_millis(100);

pub const DEFAULT_BYTE_TIMEOUT: Timeout = Timeout::new(0, 500_000);
pub const DEFAULT_RESPONSE_TIMEOUT: Timeout = Timeout::new(0, 500_000);

/// Every Modbus address of every table, so any bank window fits.
type Mirror = ModbusStorage<MAX_CAPACITY, MAX_CAPACITY, MAX_CAPACITY, MAX_CAPACITY>;

/// Unit id the mirror is run under for TCP. rmodbus treats 0 and 0xFF as
/// broadcasts, but every TCP unit id gets an answer.
const TCP_PROCESSING_UNIT: u8 = 1;
/// Largest MBAP length rmodbus accepts.
const RMODBUS_MAX_MBAP_LEN: u16 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    Request(Vec<u8>),
    /// The peer closed or reset the connection.
    ConnectionReset,
    /// The cancel token fired while waiting.
    Interrupted,
}

/// The slice of one bank a request touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    kind: BankKind,
    start: u16,
    count: u16,
    write: bool,
}

impl Window {
    fn addresses(self) -> impl Iterator<Item = u16> {
        (0..self.count).map(move |offset| self.start + offset)
    }
}

/// Map a request PDU onto the bank window it reads or writes.
fn decode_window(pdu: &[u8], mapping: &RegisterMapping<'_>) -> Result<Window, ModbusErrorCode> {
    let (kind, write, limit) = match pdu.first() {
        Some(0x01) => (BankKind::DiscreteOutputs, false, 2000),
        Some(0x02) => (BankKind::DiscreteInputs, false, 2000),
        Some(0x03) => (BankKind::AnalogOutputs, false, 125),
        Some(0x04) => (BankKind::AnalogInputs, false, 125),
        Some(0x05) => (BankKind::DiscreteOutputs, true, 1),
        Some(0x06) => (BankKind::AnalogOutputs, true, 1),
        Some(0x0F) => (BankKind::DiscreteOutputs, true, 1968),
        Some(0x10) => (BankKind::AnalogOutputs, true, 123),
        _ => return Err(ModbusErrorCode::IllegalFunction),
    };
    if pdu.len() < 5 {
        return Err(ModbusErrorCode::IllegalDataValue);
    }
    let start = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = match pdu[0] {
        0x05 | 0x06 => 1,
        _ => u16::from_be_bytes([pdu[3], pdu[4]]),
    };
    if count == 0 || count > limit {
        return Err(ModbusErrorCode::IllegalDataValue);
    }
    if matches!(pdu[0], 0x0F | 0x10) {
        // The byte count must match the quantity and the data must be present.
        let expected = if pdu[0] == 0x0F {
            usize::from(count).div_ceil(8)
        } else {
            usize::from(count) * 2
        };
        match pdu.get(5) {
            Some(&byte_count)
                if usize::from(byte_count) == expected && pdu.len() >= 6 + expected => {}
            _ => return Err(ModbusErrorCode::IllegalDataValue),
        }
    }
    if usize::from(start) + usize::from(count) > mapping.capacity(kind) {
        return Err(ModbusErrorCode::IllegalDataAddress);
    }
    Ok(Window {
        kind,
        start,
        count,
        write,
    })
}

fn engine_error(err: impl std::fmt::Debug) -> BridgeError {
    BridgeError::protocol(format!("modbus engine error: {err:?}"))
}

fn hex_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Engine {
    framing: Framing,
    byte_timeout: Option<Timeout>,
    response_timeout: Option<Timeout>,
    monitor: bool,
    mirror: Box<Mirror>,
}

impl Engine {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            byte_timeout: Some(DEFAULT_BYTE_TIMEOUT),
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            monitor: false,
            mirror: Box::new(Mirror::new()),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// `None` (or zero) lets gaps inside a frame be unbounded.
    pub fn set_byte_timeout(&mut self, timeout: Option<Timeout>) {
        self.byte_timeout = timeout.filter(|t| !t.is_zero());
    }

    pub fn set_response_timeout(&mut self, timeout: Option<Timeout>) {
        self.response_timeout = timeout.filter(|t| !t.is_zero());
    }

    pub fn byte_timeout(&self) -> Option<Timeout> {
        self.byte_timeout
    }

    pub fn response_timeout(&self) -> Option<Timeout> {
        self.response_timeout
    }

    pub fn set_monitor(&mut self, monitor: bool) {
        self.monitor = monitor;
    }

    /// Block until one complete request addressed to this endpoint arrived.
    ///
    /// The first byte is awaited without limit. Once a frame has started the
    /// byte timeout bounds every gap, or without one the response timeout
    /// bounds the whole remainder; running out mid-frame is a protocol error.
    pub fn receive(
        &mut self,
        link: &mut dyn Link,
        cancel: &CancelToken,
    ) -> BridgeResult<Indication> {
        let mut frame: Vec<u8> = Vec::with_capacity(self.framing.max_adu());
        let mut chunk = [0u8; 260];
        let mut deadline: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(Indication::Interrupted);
            }

            let expected = self.framing.expected_len(&frame)?;
            if frame.len() >= expected {
                if !self.framing.addressed_to_us(&frame) {
                    log::debug!(
                        "Ignoring request for unit {}",
                        self.framing.unit_of(&frame)
                    );
                    frame.clear();
                    deadline = None;
                    continue;
                }
                self.framing.check_integrity(&frame)?;
                if self.monitor {
                    println!("< {}", hex_line(&frame));
                }
                return Ok(Indication::Request(frame));
            }

            let wait = match deadline {
                None => POLL_SLICE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(BridgeError::protocol(format!(
                            "timed out after {} of {expected} bytes",
                            frame.len()
                        )));
                    }
                    left.min(POLL_SLICE)
                }
            };
            link.set_read_timeout(wait.max(Duration::from_millis(1)))
                .map_err(|e| BridgeError::protocol_io("failed to arm receive timeout", e))?;

            let want = expected - frame.len();
            match link.read(&mut chunk[..want]) {
                Ok(0) if cancel.is_cancelled() => return Ok(Indication::Interrupted),
                Ok(0) => return Ok(Indication::ConnectionReset),
                Ok(n) => {
                    let first = frame.is_empty();
                    frame.extend_from_slice(&chunk[..n]);
                    let now = Instant::now();
                    deadline = match (self.byte_timeout, self.response_timeout) {
                        (Some(gap), _) => Some(now + gap.as_duration()),
                        (None, Some(total)) if first => Some(now + total.as_duration()),
                        (None, Some(_)) => deadline,
                        (None, None) => None,
                    };
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) if cancel.is_cancelled() => return Ok(Indication::Interrupted),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Ok(Indication::ConnectionReset)
                }
                Err(e) => return Err(BridgeError::protocol_io("modbus receive failed", e)),
            }
        }
    }

    /// Process `request` against `mapping` and send the response, if any.
    pub fn reply(
        &mut self,
        link: &mut dyn Link,
        request: &[u8],
        mapping: &mut RegisterMapping<'_>,
    ) -> BridgeResult<()> {
        let Some(response) = self.respond(request, mapping)? else {
            return Ok(());
        };
        if self.monitor {
            println!("> {}", hex_line(&response));
        }
        match link.write_all(&response).and_then(|_| link.flush()) {
            Ok(()) => Ok(()),
            // The next receive reports the closed connection.
            Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                log::debug!("Reply dropped: {e}");
                Ok(())
            }
            Err(e) => Err(BridgeError::protocol_io("modbus reply failed", e)),
        }
    }

    /// Build the response frame; `None` for broadcasts and ignored requests.
    pub fn respond(
        &mut self,
        request: &[u8],
        mapping: &mut RegisterMapping<'_>,
    ) -> BridgeResult<Option<Vec<u8>>> {
        let broadcast = matches!(self.framing, Framing::Rtu { .. }) && request[0] == 0;
        let answer = |response: Vec<u8>| if broadcast { None } else { Some(response) };

        let pdu = &request[self.framing.pdu_offset()..];
        let window = match decode_window(pdu, mapping) {
            Ok(window) => window,
            Err(code) => {
                log::debug!("Rejecting request with exception {code:?}");
                return Ok(answer(self.framing.exception(request, code.byte())));
            }
        };
        if let Err(err) = self.load(window, mapping) {
            log::warn!("{err}");
            return Ok(answer(
                self.framing
                    .exception(request, ModbusErrorCode::SlaveDeviceFailure.byte()),
            ));
        }

        let (unit, frame_bytes) = match self.framing {
            Framing::Rtu { unit_id } => (unit_id, request.to_vec()),
            Framing::Tcp => {
                let mut tcp = request.to_vec();
                tcp[6] = TCP_PROCESSING_UNIT;
                // The frame is already delimited; rmodbus only range checks this field.
                let length = u16::from_be_bytes([tcp[4], tcp[5]]).min(RMODBUS_MAX_MBAP_LEN);
                tcp[4..6].copy_from_slice(&length.to_be_bytes());
                (TCP_PROCESSING_UNIT, tcp)
            }
        };
        let mut response = Vec::new();
        let response_required = {
            let mut frame =
                ModbusFrame::new(unit, &frame_bytes, self.framing.proto(), &mut response);
            frame.parse().map_err(engine_error)?;
            if frame.processing_required {
                let result = if frame.readonly {
                    frame.process_read(&*self.mirror)
                } else {
                    frame.process_write(&mut *self.mirror)
                };
                result.map_err(engine_error)?;
                if window.write {
                    self.store(window, mapping)?;
                }
            }
            if frame.response_required {
                frame.finalize_response().map_err(engine_error)?;
            }
            frame.response_required
        };

        if !response_required {
            return Ok(None);
        }
        if let (Framing::Tcp, Some(slot)) = (self.framing, response.get_mut(6)) {
            *slot = request[6];
        }
        Ok(answer(response))
    }

    fn load(&mut self, window: Window, mapping: &RegisterMapping<'_>) -> BridgeResult<()> {
        let kind = window.kind;
        for address in window.addresses() {
            let index = usize::from(address);
            match kind {
                BankKind::DiscreteOutputs => self
                    .mirror
                    .set_coil(address, mapping.coil(kind, index).unwrap_or(false)),
                BankKind::DiscreteInputs => self
                    .mirror
                    .set_discrete(address, mapping.coil(kind, index).unwrap_or(false)),
                BankKind::AnalogOutputs => self
                    .mirror
                    .set_holding(address, mapping.register(kind, index).unwrap_or(0)),
                BankKind::AnalogInputs => self
                    .mirror
                    .set_input(address, mapping.register(kind, index).unwrap_or(0)),
            }
            .map_err(engine_error)?;
        }
        Ok(())
    }

    fn store(&self, window: Window, mapping: &mut RegisterMapping<'_>) -> BridgeResult<()> {
        let kind = window.kind;
        for address in window.addresses() {
            let index = usize::from(address);
            let stored = match kind {
                BankKind::DiscreteOutputs => {
                    let value = self.mirror.get_coil(address).map_err(engine_error)?;
                    mapping.set_coil(kind, index, value)
                }
                BankKind::AnalogOutputs => {
                    let value = self.mirror.get_holding(address).map_err(engine_error)?;
                    mapping.set_register(kind, index, value)
                }
                BankKind::DiscreteInputs | BankKind::AnalogInputs => Some(()),
            };
            if stored.is_none() {
                return Err(BridgeError::protocol(format!(
                    "{kind} address {address} vanished while replying"
                )));
            }
        }
        Ok(())
    }
}
