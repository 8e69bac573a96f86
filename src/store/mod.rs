//! Register store: the four Modbus data banks kept in named shared memory.
//!
//! | bank | Modbus table        | element | external access | object name      |
//! |------|---------------------|---------|-----------------|------------------|
//! | DO   | coils               | 1 byte  | read-write      | `<prefix>DO`     |
//! | DI   | discrete inputs     | 1 byte  | read-only       | `<prefix>DI`     |
//! | AO   | holding registers   | 2 bytes | read-write      | `<prefix>AO`     |
//! | AI   | input registers     | 2 bytes | read-only       | `<prefix>AI`     |
//!
//! Coil elements only use bit 0; the upper seven bits belong to whoever writes
//! them and are never touched by the protocol side. Register elements hold the
//! 16-bit value in network byte order.
pub mod region;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};
pub use region::{Ownership, SharedRegion};

/// Largest addressable bank (Modbus addresses are 16 bit).
pub const MAX_CAPACITY: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankKind {
    /// DO: coils
    DiscreteOutputs,
    /// DI: discrete inputs
    DiscreteInputs,
    /// AO: holding registers
    AnalogOutputs,
    /// AI: input registers
    AnalogInputs,
}

impl BankKind {
    pub const ALL: [BankKind; 4] = [
        BankKind::DiscreteOutputs,
        BankKind::DiscreteInputs,
        BankKind::AnalogOutputs,
        BankKind::AnalogInputs,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            BankKind::DiscreteOutputs => "DO",
            BankKind::DiscreteInputs => "DI",
            BankKind::AnalogOutputs => "AO",
            BankKind::AnalogInputs => "AI",
        }
    }

    /// Bytes per element in the shared region.
    pub fn element_width(self) -> usize {
        if self.is_bit_bank() {
            1
        } else {
            2
        }
    }

    pub fn is_bit_bank(self) -> bool {
        matches!(self, BankKind::DiscreteOutputs | BankKind::DiscreteInputs)
    }

    /// Whether external processes may write this bank.
    pub fn is_externally_writable(self) -> bool {
        matches!(self, BankKind::DiscreteOutputs | BankKind::AnalogOutputs)
    }
}

impl fmt::Display for BankKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankKind::DiscreteOutputs => write!(f, "discrete output coils"),
            BankKind::DiscreteInputs => write!(f, "discrete input coils"),
            BankKind::AnalogOutputs => write!(f, "analog output registers"),
            BankKind::AnalogInputs => write!(f, "analog input registers"),
        }
    }
}

/// Number of elements per bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacities {
    #[serde(default = "max_capacity")]
    pub discrete_outputs: usize,
    #[serde(default = "max_capacity")]
    pub discrete_inputs: usize,
    #[serde(default = "max_capacity")]
    pub analog_outputs: usize,
    #[serde(default = "max_capacity")]
    pub analog_inputs: usize,
}

fn max_capacity() -> usize {
    MAX_CAPACITY
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            discrete_outputs: MAX_CAPACITY,
            discrete_inputs: MAX_CAPACITY,
            analog_outputs: MAX_CAPACITY,
            analog_inputs: MAX_CAPACITY,
        }
    }
}

impl Capacities {
    pub fn get(&self, kind: BankKind) -> usize {
        match kind {
            BankKind::DiscreteOutputs => self.discrete_outputs,
            BankKind::DiscreteInputs => self.discrete_inputs,
            BankKind::AnalogOutputs => self.analog_outputs,
            BankKind::AnalogInputs => self.analog_inputs,
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        for kind in BankKind::ALL {
            let capacity = self.get(kind);
            if capacity > MAX_CAPACITY {
                return Err(BridgeError::config(format!(
                    "too many {kind} ({capacity}, maximum: {MAX_CAPACITY})"
                )));
            }
        }
        Ok(())
    }
}

/// One bank backed by its own shared-memory region.
#[derive(Debug)]
pub struct RegisterBank {
    kind: BankKind,
    region: SharedRegion,
}

impl RegisterBank {
    fn open(
        prefix: &str,
        kind: BankKind,
        capacity: usize,
        allow_reuse: bool,
        permissions: u32,
    ) -> BridgeResult<Self> {
        let name = format!("{prefix}{}", kind.suffix());
        let region = SharedRegion::create(
            &name,
            capacity * kind.element_width(),
            allow_reuse,
            permissions,
        )?;
        Ok(Self { kind, region })
    }

    pub fn kind(&self) -> BankKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn ownership(&self) -> Ownership {
        self.region.ownership()
    }

    /// Element count; for a reused region this follows the size found.
    pub fn capacity(&self) -> usize {
        self.region.len() / self.kind.element_width()
    }

    pub fn bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }
}

/// The four banks, created together or not at all.
#[derive(Debug)]
pub struct RegisterStore {
    discrete_outputs: RegisterBank,
    discrete_inputs: RegisterBank,
    analog_outputs: RegisterBank,
    analog_inputs: RegisterBank,
}

impl RegisterStore {
    /// Create (or with `allow_reuse`, attach) all four regions named `<prefix>DO` .. `<prefix>AI`.
    ///
    /// Capacities are validated before anything is created. A failure on a later
    /// bank drops the earlier ones, which unlinks whatever this call created.
    pub fn create(
        prefix: &str,
        capacities: Capacities,
        allow_reuse: bool,
        permissions: u32,
    ) -> BridgeResult<Self> {
        capacities.validate()?;
        let bare = prefix.trim_start_matches('/');
        if bare.is_empty() || bare.contains('/') {
            return Err(BridgeError::config(format!(
                "'{prefix}' is not a valid shared memory name prefix"
            )));
        }
        if permissions > 0o777 {
            return Err(BridgeError::config(format!(
                "invalid permission bits {permissions:o}"
            )));
        }

        let open = |kind| {
            RegisterBank::open(prefix, kind, capacities.get(kind), allow_reuse, permissions)
        };
        let discrete_outputs = open(BankKind::DiscreteOutputs)?;
        let discrete_inputs = open(BankKind::DiscreteInputs)?;
        let analog_outputs = open(BankKind::AnalogOutputs)?;
        let analog_inputs = open(BankKind::AnalogInputs)?;

        log::info!(
            "Register store ready: DO={} DI={} AO={} AI={}",
            discrete_outputs.capacity(),
            discrete_inputs.capacity(),
            analog_outputs.capacity(),
            analog_inputs.capacity()
        );

        Ok(Self {
            discrete_outputs,
            discrete_inputs,
            analog_outputs,
            analog_inputs,
        })
    }

    pub fn bank(&self, kind: BankKind) -> &RegisterBank {
        match kind {
            BankKind::DiscreteOutputs => &self.discrete_outputs,
            BankKind::DiscreteInputs => &self.discrete_inputs,
            BankKind::AnalogOutputs => &self.analog_outputs,
            BankKind::AnalogInputs => &self.analog_inputs,
        }
    }

    pub fn bank_mut(&mut self, kind: BankKind) -> &mut RegisterBank {
        match kind {
            BankKind::DiscreteOutputs => &mut self.discrete_outputs,
            BankKind::DiscreteInputs => &mut self.discrete_inputs,
            BankKind::AnalogOutputs => &mut self.analog_outputs,
            BankKind::AnalogInputs => &mut self.analog_inputs,
        }
    }

    /// Lend the raw spans to the protocol side. The store keeps ownership.
    pub fn mapping_handle(&mut self) -> RegisterMapping<'_> {
        RegisterMapping::new(
            self.discrete_outputs.bytes_mut(),
            self.discrete_inputs.bytes_mut(),
            self.analog_outputs.bytes_mut(),
            self.analog_inputs.bytes_mut(),
        )
    }
}

/// Borrowed view of the four banks, in the layout described at module level.
#[derive(Debug)]
pub struct RegisterMapping<'a> {
    coils: &'a mut [u8],
    discrete_inputs: &'a mut [u8],
    holding: &'a mut [u8],
    input: &'a mut [u8],
}

impl<'a> RegisterMapping<'a> {
    /// Bind arbitrary memory; register spans use two bytes per element.
    pub fn new(
        coils: &'a mut [u8],
        discrete_inputs: &'a mut [u8],
        holding: &'a mut [u8],
        input: &'a mut [u8],
    ) -> Self {
        Self {
            coils,
            discrete_inputs,
            holding,
            input,
        }
    }

    pub fn span(&self, kind: BankKind) -> &[u8] {
        match kind {
            BankKind::DiscreteOutputs => &*self.coils,
            BankKind::DiscreteInputs => &*self.discrete_inputs,
            BankKind::AnalogOutputs => &*self.holding,
            BankKind::AnalogInputs => &*self.input,
        }
    }

    pub fn span_mut(&mut self, kind: BankKind) -> &mut [u8] {
        match kind {
            BankKind::DiscreteOutputs => &mut *self.coils,
            BankKind::DiscreteInputs => &mut *self.discrete_inputs,
            BankKind::AnalogOutputs => &mut *self.holding,
            BankKind::AnalogInputs => &mut *self.input,
        }
    }

    pub fn capacity(&self, kind: BankKind) -> usize {
        self.span(kind).len() / kind.element_width()
    }

    pub fn coil(&self, kind: BankKind, index: usize) -> Option<bool> {
        debug_assert!(kind.is_bit_bank());
        self.span(kind).get(index).map(|byte| byte & 0x01 != 0)
    }

    /// Set bit 0 of the element, keeping the scratch bits.
    pub fn set_coil(&mut self, kind: BankKind, index: usize, value: bool) -> Option<()> {
        debug_assert!(kind.is_bit_bank());
        let byte = self.span_mut(kind).get_mut(index)?;
        *byte = (*byte & !0x01) | u8::from(value);
        Some(())
    }

    pub fn register(&self, kind: BankKind, index: usize) -> Option<u16> {
        debug_assert!(!kind.is_bit_bank());
        let raw = self.span(kind).get(index * 2..index * 2 + 2)?;
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn set_register(&mut self, kind: BankKind, index: usize, value: u16) -> Option<()> {
        debug_assert!(!kind.is_bit_bank());
        let raw = self.span_mut(kind).get_mut(index * 2..index * 2 + 2)?;
        raw.copy_from_slice(&value.to_be_bytes());
        Some(())
    }
}
