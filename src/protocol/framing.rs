//! Where a request starts, ends and carries its PDU, for both transports.
use crc::{Crc, CRC_16_MODBUS};
use rmodbus::ModbusProto;

use crate::error::{BridgeError, BridgeResult};

pub const RTU_MAX_ADU: usize = 256;
pub const TCP_MAX_ADU: usize = 260;
const MBAP_LEN: usize = 7;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Serial line; only requests for `unit_id` or broadcast 0 are served.
    Rtu { unit_id: u8 },
    /// MBAP-framed socket; every unit id is served.
    Tcp,
}

impl Framing {
    pub fn proto(self) -> ModbusProto {
        match self {
            Framing::Rtu { .. } => ModbusProto::Rtu,
            Framing::Tcp => ModbusProto::TcpUdp,
        }
    }

    pub fn max_adu(self) -> usize {
        match self {
            Framing::Rtu { .. } => RTU_MAX_ADU,
            Framing::Tcp => TCP_MAX_ADU,
        }
    }

    /// Index of the function code inside a frame.
    pub fn pdu_offset(self) -> usize {
        match self {
            Framing::Rtu { .. } => 1,
            Framing::Tcp => MBAP_LEN,
        }
    }

    pub fn unit_of(self, frame: &[u8]) -> u8 {
        match self {
            Framing::Rtu { .. } => frame[0],
            Framing::Tcp => frame[MBAP_LEN - 1],
        }
    }

    /// Total frame length as far as `received` tells so far.
    ///
    /// Growing `received` up to the returned length and asking again converges
    /// on the final length.
    pub fn expected_len(self, received: &[u8]) -> BridgeResult<usize> {
        let total = match self {
            Framing::Rtu { .. } => {
                if received.len() < 2 {
                    return Ok(2);
                }
                let function = received[1];
                let head = 2 + rtu_meta_len(function);
                if received.len() < head {
                    return Ok(head);
                }
                let data = match function {
                    0x0F | 0x10 | 0x17 => usize::from(received[head - 1]),
                    _ => 0,
                };
                head + data + 2
            }
            Framing::Tcp => {
                if received.len() < MBAP_LEN {
                    return Ok(MBAP_LEN);
                }
                let length = usize::from(u16::from_be_bytes([received[4], received[5]]));
                if length < 2 {
                    return Err(BridgeError::protocol(format!(
                        "invalid MBAP length {length}"
                    )));
                }
                6 + length
            }
        };
        if total > self.max_adu() {
            return Err(BridgeError::protocol(format!(
                "request of {total} bytes exceeds the {} byte limit",
                self.max_adu()
            )));
        }
        Ok(total)
    }

    /// Whether this endpoint has to look at a complete frame at all.
    pub fn addressed_to_us(self, frame: &[u8]) -> bool {
        match self {
            Framing::Rtu { unit_id } => frame[0] == unit_id || frame[0] == 0,
            Framing::Tcp => true,
        }
    }

    /// RTU frames must carry a valid trailing CRC; TCP relies on the transport.
    pub fn check_integrity(self, frame: &[u8]) -> BridgeResult<()> {
        if let Framing::Rtu { .. } = self {
            let (body, tail) = frame.split_at(frame.len() - 2);
            let received = u16::from_le_bytes([tail[0], tail[1]]);
            let computed = MODBUS_CRC.checksum(body);
            if received != computed {
                return Err(BridgeError::protocol(format!(
                    "invalid CRC {received:04x} (expected {computed:04x})"
                )));
            }
        } else if frame[2..4] != [0, 0] {
            return Err(BridgeError::protocol("invalid MBAP protocol identifier"));
        }
        Ok(())
    }

    /// Exception response for `request`, built without the engine.
    pub fn exception(self, request: &[u8], code: u8) -> Vec<u8> {
        let function = request[self.pdu_offset()] | 0x80;
        match self {
            Framing::Rtu { .. } => with_crc(vec![request[0], function, code]),
            Framing::Tcp => vec![
                request[0],
                request[1],
                0,
                0,
                0,
                3,
                request[MBAP_LEN - 1],
                function,
                code,
            ],
        }
    }
}

/// Bytes between the function code and the data block of an RTU request.
fn rtu_meta_len(function: u8) -> usize {
    match function {
        0x00..=0x06 => 4,
        0x0F | 0x10 => 5,
        0x16 => 6,
        0x17 => 9,
        _ => 0,
    }
}

/// Append the Modbus CRC to an RTU body.
pub fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = MODBUS_CRC.checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}
