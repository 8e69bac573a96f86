use std::time::Duration;

use super::config::{BridgeConfig, EndpointConfig};
use crate::{
    error::{BridgeResult, EX_OK},
    protocol::{run_request_loop, CancelToken, LoopOutcome, TcpAcceptor, TransportSession},
    store::RegisterStore,
    sync::AccessGuard,
};

/// Time the loop gets to unwind after a termination request before the
/// process exits regardless.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Route SIGINT and SIGTERM to `cancel` and arm the exit watchdog.
pub fn install_termination_handler(cancel: CancelToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            return;
        }
        cancel.cancel();
        std::thread::spawn(|| {
            std::thread::sleep(TERMINATION_GRACE);
            log::warn!("Request loop did not stop in time, exiting");
            std::process::exit(EX_OK);
        });
    })?;
    Ok(())
}

/// Create the store, connect the transport, attach the guard and serve
/// requests until the master leaves or `cancel` fires.
pub fn run_bridge(config: &BridgeConfig, cancel: &CancelToken) -> BridgeResult<LoopOutcome> {
    config.validate()?;
    let permissions = config.store.permission_bits()?;

    let mut store = RegisterStore::create(
        &config.store.name_prefix,
        config.store.capacities,
        config.store.force,
        permissions,
    )?;
    let mapping = store.mapping_handle();

    let mut session = match &config.endpoint {
        EndpointConfig::Rtu(rtu) => TransportSession::connect_rtu(
            &rtu.serial_params()?,
            rtu.unit_id,
            mapping,
            cancel.clone(),
        )?,
        EndpointConfig::Tcp(tcp) => {
            let acceptor = TcpAcceptor::bind(&tcp.host, tcp.port)?;
            log::info!("Waiting for a Modbus TCP client on {}", acceptor.local_addr()?);
            match TransportSession::accept_tcp(acceptor, mapping, cancel.clone())? {
                Some(session) => session,
                None => return Ok(LoopOutcome::Cancelled),
            }
        }
    };
    session.set_timeouts(config.timeouts.byte_timeout, config.timeouts.response_timeout)?;
    session.set_monitor(config.monitor);

    if let Some(semaphore) = &config.semaphore {
        session.enable_guard(AccessGuard::open(
            &semaphore.name,
            semaphore.force,
            permissions,
        )?)?;
    }

    run_request_loop(&mut session, cancel)
}
