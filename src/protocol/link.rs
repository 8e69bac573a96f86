//! Communication handles a session talks through.
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, TTYPort};

use super::cancel::CancelToken;
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Serial,
    Tcp,
}

/// Byte stream with a settable read timeout and a raw OS handle.
pub trait Link: Read + Write + Send {
    fn kind(&self) -> LinkKind;

    fn raw_handle(&self) -> RawFd;

    /// `timeout` is never zero.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Handle that [`CancelToken::cancel`] may shut down to wake a blocked read.
    fn shutdown_handle(&self) -> Option<RawFd> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl Parity {
    pub fn as_char(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "N" => Ok(Parity::None),
            "E" => Ok(Parity::Even),
            "O" => Ok(Parity::Odd),
            _ => Err(BridgeError::config(format!(
                "invalid parity '{s}' (expected N, E or O)"
            ))),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// Electrical mode of the serial driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    Rs232,
    Rs485,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// `None` leaves the driver in whatever mode it is in.
    pub mode: Option<SerialMode>,
}

impl SerialParams {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.device.is_empty() {
            return Err(BridgeError::config("serial device must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(BridgeError::config("baud rate must be at least 1"));
        }
        data_bits(self.data_bits)?;
        stop_bits(self.stop_bits)?;
        Ok(())
    }
}

fn data_bits(bits: u8) -> BridgeResult<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        _ => Err(BridgeError::config(format!(
            "invalid number of data bits {bits} (expected 5 to 8)"
        ))),
    }
}

fn stop_bits(bits: u8) -> BridgeResult<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        _ => Err(BridgeError::config(format!(
            "invalid number of stop bits {bits} (expected 1 or 2)"
        ))),
    }
}

pub struct SerialLink {
    device: String,
    port: TTYPort,
}

impl SerialLink {
    pub fn open(params: &SerialParams) -> BridgeResult<Self> {
        params.validate()?;
        let connection_error = |e: serialport::Error| {
            BridgeError::connection(format!("failed to open {}", params.device), e.into())
        };

        let mut port = serialport::new(&params.device, params.baud_rate)
            .parity(params.parity.into())
            .data_bits(data_bits(params.data_bits)?)
            .stop_bits(stop_bits(params.stop_bits)?)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open_native()
            .map_err(connection_error)?;
        port.set_exclusive(true).map_err(connection_error)?;

        if let Some(mode) = params.mode {
            set_serial_mode(port.as_raw_fd(), mode).map_err(|e| {
                BridgeError::connection(format!("failed to select {mode:?} on {}", params.device), e)
            })?;
        }

        log::debug!(
            "Opened {} at {} baud ({}{}{})",
            params.device,
            params.baud_rate,
            params.data_bits,
            params.parity.as_char(),
            params.stop_bits
        );
        Ok(Self {
            device: params.device.clone(),
            port,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Serial
    }

    fn raw_handle(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }
}

#[cfg(target_os = "linux")]
fn set_serial_mode(fd: RawFd, mode: SerialMode) -> io::Result<()> {
    // struct serial_rs485 from <linux/serial.h>
    #[repr(C)]
    #[derive(Default)]
    struct SerialRs485 {
        flags: u32,
        delay_rts_before_send: u32,
        delay_rts_after_send: u32,
        padding: [u32; 5],
    }
    const SER_RS485_ENABLED: u32 = 1;

    let mut conf = SerialRs485::default();
    if unsafe { libc::ioctl(fd, libc::TIOCGRS485 as _, &mut conf as *mut SerialRs485) } < 0 {
        return Err(io::Error::last_os_error());
    }
    match mode {
        SerialMode::Rs485 => conf.flags |= SER_RS485_ENABLED,
        SerialMode::Rs232 => conf.flags &= !SER_RS485_ENABLED,
    }
    if unsafe { libc::ioctl(fd, libc::TIOCSRS485 as _, &conf as *const SerialRs485) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_serial_mode(_fd: RawFd, _mode: SerialMode) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "serial mode selection is only available on Linux",
    ))
}

/// Listening socket that hands out exactly one connection.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(host: &str, port: u16) -> BridgeResult<Self> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| BridgeError::connection(format!("failed to listen on {host}:{port}"), e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::connection("failed to query listening address", e))
    }

    /// Wait for the master. `Ok(None)` when `cancel` fired first.
    pub fn accept(self, cancel: &CancelToken) -> BridgeResult<Option<TcpLink>> {
        if !cancel.arm(self.listener.as_raw_fd()) {
            cancel.disarm();
            return Ok(None);
        }
        let accepted = self.listener.accept();
        cancel.disarm();

        match accepted {
            Ok((stream, peer)) => {
                log::debug!("Accepted connection from {peer}");
                Ok(Some(TcpLink::new(stream)?))
            }
            Err(_) if cancel.is_cancelled() => Ok(None),
            Err(e) => Err(BridgeError::connection("failed to accept connection", e)),
        }
    }
}

#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> BridgeResult<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| BridgeError::connection("failed to configure socket", e))?;
        Ok(Self { stream })
    }
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Link for TcpLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Tcp
    }

    fn raw_handle(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    fn shutdown_handle(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SerialParams {
        SerialParams {
            device: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            mode: None,
        }
    }

    #[test]
    fn parity_parses_case_insensitively() {
        assert_eq!("n".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("E".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("o".parse::<Parity>().unwrap(), Parity::Odd);
        assert!("X".parse::<Parity>().is_err());
    }

    #[test]
    fn serial_params_are_checked_before_opening() {
        assert!(params().validate().is_ok());
        assert!(SerialParams { data_bits: 9, ..params() }.validate().is_err());
        assert!(SerialParams { stop_bits: 3, ..params() }.validate().is_err());
        assert!(SerialParams { baud_rate: 0, ..params() }.validate().is_err());
        assert!(SerialParams { device: String::new(), ..params() }.validate().is_err());
    }

    #[test]
    fn cancelled_accept_returns_none() {
        let acceptor = TcpAcceptor::bind("127.0.0.1", 0).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(acceptor.accept(&cancel).unwrap().is_none());
    }

    #[test]
    fn accept_yields_a_tcp_link() {
        let acceptor = TcpAcceptor::bind("127.0.0.1", 0).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let link = acceptor.accept(&CancelToken::new()).unwrap().unwrap();
        assert_eq!(link.kind(), LinkKind::Tcp);
        assert_eq!(link.shutdown_handle(), Some(link.raw_handle()));
        drop(client.join().unwrap());
    }
}
