use serde::{Deserialize, Serialize};

use crate::{
    error::{BridgeError, BridgeResult},
    protocol::{Parity, SerialMode, SerialParams, Timeout},
    store::Capacities,
};

/// Transport the bridge serves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum EndpointConfig {
    Rtu(RtuConfig),
    Tcp(TcpConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtuConfig {
    pub device: String,
    pub unit_id: u8,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub rs232: bool,
    #[serde(default)]
    pub rs485: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl RtuConfig {
    pub fn new(device: impl Into<String>, unit_id: u8) -> Self {
        Self {
            device: device.into(),
            unit_id,
            baud_rate: default_baud_rate(),
            parity: Parity::default(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            rs232: false,
            rs485: false,
        }
    }

    pub fn serial_mode(&self) -> BridgeResult<Option<SerialMode>> {
        match (self.rs232, self.rs485) {
            (true, true) => Err(BridgeError::config(
                "RS232 and RS485 cannot be selected at the same time",
            )),
            (true, false) => Ok(Some(SerialMode::Rs232)),
            (false, true) => Ok(Some(SerialMode::Rs485)),
            (false, false) => Ok(None),
        }
    }

    pub fn serial_params(&self) -> BridgeResult<SerialParams> {
        let params = SerialParams {
            device: self.device.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            mode: self.serial_mode()?,
        };
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    502
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub capacities: Capacities,
    /// Attach to regions left behind by a previous instance.
    #[serde(default)]
    pub force: bool,
    /// Octal permission bits, e.g. `"0640"`.
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

fn default_name_prefix() -> String {
    "modbus_".to_string()
}

fn default_permissions() -> String {
    "0640".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            capacities: Capacities::default(),
            force: false,
            permissions: default_permissions(),
        }
    }
}

impl StoreConfig {
    pub fn permission_bits(&self) -> BridgeResult<u32> {
        parse_permissions(&self.permissions)
    }
}

/// Parse octal permission bits (`640`, `0640` or `0o640`).
pub fn parse_permissions(text: &str) -> BridgeResult<u32> {
    let digits = text.trim().trim_start_matches("0o");
    let bits = u32::from_str_radix(digits, 8)
        .map_err(|_| BridgeError::config(format!("invalid permission bits '{text}'")))?;
    if bits > 0o777 {
        return Err(BridgeError::config(format!(
            "permission bits '{text}' exceed 0777"
        )));
    }
    Ok(bits)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    pub name: String,
    /// Open the semaphore even if it already exists.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout")]
    pub byte_timeout: Option<f64>,
    #[serde(default = "default_timeout")]
    pub response_timeout: Option<f64>,
}

fn default_timeout() -> Option<f64> {
    Some(0.5)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            byte_timeout: default_timeout(),
            response_timeout: default_timeout(),
        }
    }
}

/// Everything one bridge process needs, as parsed from the command line or
/// loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub semaphore: Option<SemaphoreConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub monitor: bool,
}

impl BridgeConfig {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            store: StoreConfig::default(),
            semaphore: None,
            timeouts: TimeoutConfig::default(),
            monitor: false,
        }
    }

    /// Every check that can fail before an OS resource is touched.
    pub fn validate(&self) -> BridgeResult<()> {
        match &self.endpoint {
            EndpointConfig::Rtu(rtu) => {
                if rtu.unit_id > 247 {
                    return Err(BridgeError::config(format!(
                        "unit id {} is outside 0..=247",
                        rtu.unit_id
                    )));
                }
                rtu.serial_params()?;
            }
            EndpointConfig::Tcp(tcp) => {
                if tcp.host.is_empty() {
                    return Err(BridgeError::config("listen host must not be empty"));
                }
            }
        }

        self.store.capacities.validate()?;
        let prefix = self.store.name_prefix.trim_start_matches('/');
        if prefix.is_empty() || prefix.contains('/') {
            return Err(BridgeError::config(format!(
                "'{}' is not a valid shared memory name prefix",
                self.store.name_prefix
            )));
        }
        self.store.permission_bits()?;

        if let Some(semaphore) = &self.semaphore {
            let name = semaphore.name.trim_start_matches('/');
            if name.is_empty() || name.contains('/') {
                return Err(BridgeError::config(format!(
                    "'{}' is not a valid semaphore name",
                    semaphore.name
                )));
            }
        }

        if let Some(byte_timeout) = self.timeouts.byte_timeout {
            Timeout::from_secs_f64(byte_timeout)?;
        }
        if let Some(response_timeout) = self.timeouts.response_timeout {
            if Timeout::from_secs_f64(response_timeout)?.is_zero() {
                return Err(BridgeError::config("response timeout must be positive"));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtu() -> BridgeConfig {
        BridgeConfig::new(EndpointConfig::Rtu(RtuConfig::new("/dev/ttyS0", 1)))
    }

    #[test]
    fn defaults_are_valid() {
        let config = rtu();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.name_prefix, "modbus_");
        assert_eq!(config.store.permission_bits().unwrap(), 0o640);
        assert_eq!(config.store.capacities.analog_inputs, 65536);
    }

    #[test]
    fn both_serial_modes_are_rejected() {
        let mut config = rtu();
        if let EndpointConfig::Rtu(rtu) = &mut config.endpoint {
            rtu.rs232 = true;
            rtu.rs485 = true;
        }
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn oversized_bank_is_rejected() {
        let mut config = rtu();
        config.store.capacities.discrete_inputs = 65537;
        assert!(config.validate().is_err());
    }

    #[test]
    fn permission_parsing() {
        assert_eq!(parse_permissions("600").unwrap(), 0o600);
        assert_eq!(parse_permissions("0o755").unwrap(), 0o755);
        assert!(parse_permissions("0800").is_err());
        assert!(parse_permissions("1777").is_err());
    }

    #[test]
    fn bad_prefix_semaphore_and_timeouts() {
        let mut config = rtu();
        config.store.name_prefix = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = rtu();
        config.semaphore = Some(SemaphoreConfig {
            name: "/".into(),
            force: false,
        });
        assert!(config.validate().is_err());

        let mut config = rtu();
        config.timeouts.response_timeout = Some(0.0);
        assert!(config.validate().is_err());

        let mut config = rtu();
        config.timeouts.byte_timeout = Some(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_keeps_the_endpoint() {
        let mut config = BridgeConfig::new(EndpointConfig::Tcp(TcpConfig::default()));
        config.semaphore = Some(SemaphoreConfig {
            name: "modbus_lock".into(),
            force: true,
        });
        let json = config.to_json().unwrap();
        assert!(json.contains("\"transport\": \"tcp\""));
        assert_eq!(BridgeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let config = BridgeConfig::from_json(
            r#"{ "endpoint": { "transport": "rtu", "device": "/dev/ttyUSB0", "unit_id": 7, "parity": "E" } }"#,
        )
        .unwrap();
        let EndpointConfig::Rtu(rtu) = &config.endpoint else {
            panic!("expected an rtu endpoint");
        };
        assert_eq!(rtu.baud_rate, 9600);
        assert_eq!(rtu.parity, Parity::Even);
        assert_eq!(config.timeouts.byte_timeout, Some(0.5));
        assert!(config.validate().is_ok());
    }
}
