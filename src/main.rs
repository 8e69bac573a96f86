use modbus_shm::{
    boot,
    cli::{self, actions},
    error::{BridgeError, EX_OK, EX_OSERR, EX_SOFTWARE, EX_USAGE},
    protocol::{CancelToken, LoopOutcome},
};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = match cli::build_command().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { EX_USAGE } else { EX_OK };
        }
    };

    boot::init_logger();

    let config = match cli::config_from_matches(&matches) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err:#}");
            return err
                .downcast_ref::<BridgeError>()
                .map_or(EX_USAGE, BridgeError::exit_status);
        }
    };

    if matches.get_flag("print-config") {
        return match config.to_json() {
            Ok(json) => {
                println!("{json}");
                EX_OK
            }
            Err(err) => {
                log::error!("Failed to serialize configuration: {err}");
                EX_SOFTWARE
            }
        };
    }

    let cancel = CancelToken::new();
    if let Err(err) = actions::install_termination_handler(cancel.clone()) {
        log::error!("Failed to install signal handler: {err:#}");
        return EX_OSERR;
    }

    let status = match actions::run_bridge(&config, &cancel) {
        Ok(LoopOutcome::PeerClosed) | Ok(LoopOutcome::Cancelled) => EX_OK,
        Err(err) if cancel.is_cancelled() => {
            log::debug!("Ignoring error raised during termination: {err}");
            EX_OK
        }
        Err(err) => {
            log::error!("{err}");
            err.exit_status()
        }
    };
    log::info!("Terminating...");
    status
}
