use super::{
    cancel::CancelToken,
    session::{ServiceOutcome, TransportSession},
};
use crate::error::BridgeResult;

/// Why a request loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    PeerClosed,
    Cancelled,
}

/// Service requests until the master disconnects or `cancel` fires.
///
/// Errors raised after cancellation are side effects of the interrupt and
/// are reported as [`LoopOutcome::Cancelled`].
pub fn run_request_loop(
    session: &mut TransportSession<'_>,
    cancel: &CancelToken,
) -> BridgeResult<LoopOutcome> {
    loop {
        if cancel.is_cancelled() {
            return Ok(LoopOutcome::Cancelled);
        }
        match session.service_one_request() {
            Ok(ServiceOutcome::RequestHandled) => {}
            Ok(ServiceOutcome::ConnectionClosed) => {
                log::info!("Master closed connection.");
                return Ok(LoopOutcome::PeerClosed);
            }
            Ok(ServiceOutcome::Interrupted) => return Ok(LoopOutcome::Cancelled),
            Err(err) if cancel.is_cancelled() => {
                log::debug!("Ignoring error raised during termination: {err}");
                return Ok(LoopOutcome::Cancelled);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::BridgeError,
        protocol::{framing::Framing, framing::with_crc, testing::MockLink},
        store::RegisterMapping,
        sync::{guard::tests::ScriptedLock, AccessGuard},
    };
    use std::{io, thread, time::Duration};

    #[test]
    fn peer_close_ends_the_loop_cleanly() {
        let (mut coils, mut di, mut ao, mut ai) = (vec![0u8; 4], vec![], vec![], vec![]);
        let request = with_crc(vec![0x01, 0x05, 0x00, 0x01, 0xFF, 0x00]);
        let cancel = CancelToken::new();
        let mut session = TransportSession::from_link(
            Box::new(MockLink::new(vec![request]).closing()),
            Framing::Rtu { unit_id: 1 },
            RegisterMapping::new(&mut coils, &mut di, &mut ao, &mut ai),
            cancel.clone(),
        );

        assert_eq!(
            run_request_loop(&mut session, &cancel).unwrap(),
            LoopOutcome::PeerClosed
        );
        drop(session);
        assert_eq!(coils, vec![0, 1, 0, 0]);
    }

    #[test]
    fn receive_errors_are_fatal() {
        let (mut coils, mut di, mut ao, mut ai) = (vec![], vec![], vec![], vec![]);
        let cancel = CancelToken::new();
        let link = MockLink::failing(io::Error::new(io::ErrorKind::Other, "line noise"));
        let mut session = TransportSession::from_link(
            Box::new(link),
            Framing::Tcp,
            RegisterMapping::new(&mut coils, &mut di, &mut ao, &mut ai),
            cancel.clone(),
        );

        let err = run_request_loop(&mut session, &cancel).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolIo { .. }));
    }

    #[test]
    fn reset_is_not_an_error() {
        let (mut coils, mut di, mut ao, mut ai) = (vec![], vec![], vec![], vec![]);
        let cancel = CancelToken::new();
        let link = MockLink::failing(io::Error::from(io::ErrorKind::ConnectionReset));
        let mut session = TransportSession::from_link(
            Box::new(link),
            Framing::Tcp,
            RegisterMapping::new(&mut coils, &mut di, &mut ao, &mut ai),
            cancel.clone(),
        );

        assert_eq!(
            run_request_loop(&mut session, &cancel).unwrap(),
            LoopOutcome::PeerClosed
        );
    }

    #[test]
    fn cancel_stops_a_blocked_loop() {
        let (mut coils, mut di, mut ao, mut ai) = (vec![], vec![], vec![], vec![]);
        let cancel = CancelToken::new();
        let mut session = TransportSession::from_link(
            Box::new(MockLink::new(vec![])),
            Framing::Rtu { unit_id: 1 },
            RegisterMapping::new(&mut coils, &mut di, &mut ao, &mut ai),
            cancel.clone(),
        );

        let canceller = session.canceller();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        assert_eq!(
            run_request_loop(&mut session, &cancel).unwrap(),
            LoopOutcome::Cancelled
        );
        waker.join().unwrap();
    }

    #[test]
    fn starved_lock_aborts_the_loop() {
        let (mut coils, mut di, mut ao, mut ai) = (vec![0u8; 1], vec![], vec![], vec![]);
        let request = with_crc(vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x01]);
        let cancel = CancelToken::new();
        let mut session = TransportSession::from_link(
            Box::new(MockLink::new(vec![request; 100]).closing()),
            Framing::Rtu { unit_id: 1 },
            RegisterMapping::new(&mut coils, &mut di, &mut ao, &mut ai),
            cancel.clone(),
        );
        session
            .enable_guard(AccessGuard::with_lock(Box::new(ScriptedLock::always(false))))
            .unwrap();

        let err = run_request_loop(&mut session, &cancel).unwrap_err();
        assert!(matches!(err, BridgeError::LockStarved { .. }));
    }
}
