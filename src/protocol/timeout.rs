use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Fractional seconds kept as whole seconds plus a microsecond remainder.
///
/// The split truncates: 0.0000019 s becomes 1 µs, never 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeout {
    secs: u32,
    micros: u32,
}

impl Timeout {
    pub const ZERO: Timeout = Timeout { secs: 0, micros: 0 };

    pub const fn new(secs: u32, micros: u32) -> Self {
        Self {
            secs: secs + micros / 1_000_000,
            micros: micros % 1_000_000,
        }
    }

    pub fn from_secs_f64(value: f64) -> BridgeResult<Self> {
        if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
            return Err(BridgeError::config(format!("invalid timeout {value}")));
        }
        let whole = value.trunc();
        let micros = ((value - whole) * 1_000_000.0) as u32;
        Ok(Self::new(whole as u32, micros))
    }

    pub fn secs(self) -> u32 {
        self.secs
    }

    pub fn micros(self) -> u32 {
        self.micros
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    pub fn as_secs_f64(self) -> f64 {
        f64::from(self.secs) + f64::from(self.micros) / 1_000_000.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::new(u64::from(self.secs), self.micros * 1_000)
    }
}

impl std::fmt::Display for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}s", self.secs, self.micros)
    }
}
