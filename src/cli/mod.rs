pub mod actions;
pub mod config;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::{
    error::{BridgeError, BridgeResult},
    protocol::Parity,
    store::{Capacities, MAX_CAPACITY},
};
use config::{BridgeConfig, EndpointConfig, RtuConfig, SemaphoreConfig, StoreConfig, TcpConfig, TimeoutConfig};

const SHARED_MEMORY_HELP: &str = "\
Shared memory objects (prefix defaults to 'modbus_'):
  <prefix>DO   coils               1 byte per element, bit 0 is the value
  <prefix>DI   discrete inputs     1 byte per element, bit 0 is the value
  <prefix>AO   holding registers   2 bytes per element, network byte order
  <prefix>AI   input registers     2 bytes per element, network byte order

Writers that want consistent updates take the semaphore given by --semaphore
before touching a region and post it afterwards.";

/// The full command line of the bridge binary.
pub fn build_command() -> Command {
    Command::new("modbus-shm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Modbus RTU/TCP endpoint that keeps its registers in POSIX shared memory")
        .after_help(SHARED_MEMORY_HELP)
        .args_conflicts_with_subcommands(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Load the complete configuration from a JSON file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print the effective configuration as JSON and exit")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(shared_args(
            Command::new("rtu")
                .about("Serve as a Modbus RTU slave on a serial line")
                .arg(
                    Arg::new("device")
                        .long("device")
                        .short('d')
                        .help("Serial device, e.g. /dev/ttyUSB0")
                        .value_name("DEVICE")
                        .required(true),
                )
                .arg(
                    Arg::new("id")
                        .long("id")
                        .short('i')
                        .help("Modbus unit id of this slave")
                        .value_name("ID")
                        .required(true)
                        .value_parser(clap::value_parser!(u8).range(0..=247)),
                )
                .arg(
                    Arg::new("parity")
                        .long("parity")
                        .short('p')
                        .help("Parity: N, E or O")
                        .value_name("PARITY")
                        .default_value("N"),
                )
                .arg(
                    Arg::new("data-bits")
                        .long("data-bits")
                        .help("Data bits (5 to 8)")
                        .value_name("BITS")
                        .default_value("8")
                        .value_parser(clap::value_parser!(u8).range(5..=8)),
                )
                .arg(
                    Arg::new("stop-bits")
                        .long("stop-bits")
                        .help("Stop bits (1 or 2)")
                        .value_name("BITS")
                        .default_value("1")
                        .value_parser(clap::value_parser!(u8).range(1..=2)),
                )
                .arg(
                    Arg::new("baud")
                        .long("baud")
                        .short('b')
                        .help("Baud rate")
                        .value_name("BAUD")
                        .default_value("9600")
                        .value_parser(clap::value_parser!(u32).range(1..)),
                )
                .arg(
                    Arg::new("rs232")
                        .long("rs232")
                        .help("Switch the serial driver to RS232 mode")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("rs485"),
                )
                .arg(
                    Arg::new("rs485")
                        .long("rs485")
                        .help("Switch the serial driver to RS485 mode")
                        .action(ArgAction::SetTrue),
                ),
        ))
        .subcommand(shared_args(
            Command::new("tcp")
                .about("Serve as a Modbus TCP server for a single client")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("Address to listen on")
                        .value_name("HOST")
                        .default_value("0.0.0.0"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('p')
                        .help("Port to listen on")
                        .value_name("PORT")
                        .default_value("502")
                        .value_parser(clap::value_parser!(u16)),
                ),
        ))
}

/// Options every transport shares: register store, semaphore and timeouts.
fn shared_args(command: Command) -> Command {
    let registers = |id: &'static str, what: &'static str| {
        Arg::new(id)
            .long(id)
            .help(format!("Number of {what} (0 to {MAX_CAPACITY})"))
            .value_name("COUNT")
            .default_value("65536")
            .value_parser(clap::value_parser!(usize))
    };

    command
        .arg(
            Arg::new("name-prefix")
                .long("name-prefix")
                .short('n')
                .help("Prefix of the shared memory object names")
                .value_name("PREFIX")
                .default_value("modbus_"),
        )
        .arg(registers("do-registers", "coils (DO)"))
        .arg(registers("di-registers", "discrete inputs (DI)"))
        .arg(registers("ao-registers", "holding registers (AO)"))
        .arg(registers("ai-registers", "input registers (AI)"))
        .arg(
            Arg::new("force")
                .long("force")
                .help("Attach to shared memory left behind by a previous instance")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("permissions")
                .long("permissions")
                .help("Octal permission bits of the shared memory objects")
                .value_name("MODE")
                .default_value("0640"),
        )
        .arg(
            Arg::new("semaphore")
                .long("semaphore")
                .help("Guard register access with this named semaphore")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("semaphore-force")
                .long("semaphore-force")
                .help("Use the semaphore even if it already exists")
                .action(ArgAction::SetTrue)
                .requires("semaphore"),
        )
        .arg(
            Arg::new("byte-timeout")
                .long("byte-timeout")
                .help("Longest gap between two bytes of a request in seconds (0 disables)")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("response-timeout")
                .long("response-timeout")
                .help("Longest time to receive a request in seconds")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("monitor")
                .long("monitor")
                .short('m')
                .help("Print every received and sent frame")
                .action(ArgAction::SetTrue),
        )
}

fn value<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> BridgeResult<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| BridgeError::config(format!("missing value for --{id}")))
}

/// Turn parsed arguments into a validated configuration.
pub fn config_from_matches(matches: &ArgMatches) -> anyhow::Result<BridgeConfig> {
    let config = if let Some(path) = matches.get_one::<String>("config") {
        BridgeConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))
            .map_err(|e| BridgeError::config(format!("{e:#}")))?
    } else {
        match matches.subcommand() {
            Some(("rtu", sub)) => {
                let parity: String = value(sub, "parity")?;
                let rtu = RtuConfig {
                    device: value(sub, "device")?,
                    unit_id: value(sub, "id")?,
                    baud_rate: value(sub, "baud")?,
                    parity: parity.parse::<Parity>()?,
                    data_bits: value(sub, "data-bits")?,
                    stop_bits: value(sub, "stop-bits")?,
                    rs232: sub.get_flag("rs232"),
                    rs485: sub.get_flag("rs485"),
                };
                shared_config(sub, EndpointConfig::Rtu(rtu))?
            }
            Some(("tcp", sub)) => {
                let tcp = TcpConfig {
                    host: value(sub, "host")?,
                    port: value(sub, "port")?,
                };
                shared_config(sub, EndpointConfig::Tcp(tcp))?
            }
            _ => {
                return Err(
                    BridgeError::config("either a transport subcommand or --config is required").into(),
                )
            }
        }
    };
    config.validate()?;
    Ok(config)
}

fn shared_config(matches: &ArgMatches, endpoint: EndpointConfig) -> BridgeResult<BridgeConfig> {
    let defaults = TimeoutConfig::default();
    Ok(BridgeConfig {
        endpoint,
        store: StoreConfig {
            name_prefix: value(matches, "name-prefix")?,
            capacities: Capacities {
                discrete_outputs: value(matches, "do-registers")?,
                discrete_inputs: value(matches, "di-registers")?,
                analog_outputs: value(matches, "ao-registers")?,
                analog_inputs: value(matches, "ai-registers")?,
            },
            force: matches.get_flag("force"),
            permissions: value(matches, "permissions")?,
        },
        semaphore: matches
            .get_one::<String>("semaphore")
            .map(|name| SemaphoreConfig {
                name: name.clone(),
                force: matches.get_flag("semaphore-force"),
            }),
        timeouts: TimeoutConfig {
            byte_timeout: matches
                .get_one::<f64>("byte-timeout")
                .copied()
                .or(defaults.byte_timeout),
            response_timeout: matches
                .get_one::<f64>("response-timeout")
                .copied()
                .or(defaults.response_timeout),
        },
        monitor: matches.get_flag("monitor"),
    })
}
