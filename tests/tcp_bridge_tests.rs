use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use modbus_shm::{
    protocol::{run_request_loop, CancelToken, LoopOutcome, TcpAcceptor, TransportSession},
    store::{BankKind, Capacities, RegisterStore},
    sync::AccessGuard,
};

static SEQ: AtomicUsize = AtomicUsize::new(0);

fn unique(tag: &str) -> String {
    format!(
        "tcp_it_{}_{}_{tag}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Run a TCP bridge on a loopback port in a background thread.
///
/// `prepare` sees the store before the session starts, the way an external
/// process would; the thread returns the loop outcome and the final DO bank.
fn spawn_bridge(
    capacities: Capacities,
    semaphore: Option<String>,
    prepare: impl FnOnce(&mut RegisterStore) + Send + 'static,
    cancel: CancelToken,
) -> (SocketAddr, thread::JoinHandle<(LoopOutcome, Vec<u8>)>) {
    let prefix = unique("bridge_");
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut store = RegisterStore::create(&prefix, capacities, false, 0o600).unwrap();
        prepare(&mut store);
        let acceptor = TcpAcceptor::bind("127.0.0.1", 0).unwrap();
        tx.send(acceptor.local_addr().unwrap()).unwrap();

        let outcome = {
            let mut session =
                TransportSession::accept_tcp(acceptor, store.mapping_handle(), cancel.clone())
                    .unwrap()
                    .unwrap();
            session.set_timeouts(Some(0.2), Some(0.5)).unwrap();
            if let Some(name) = semaphore {
                session
                    .enable_guard(AccessGuard::open(&name, true, 0o600).unwrap())
                    .unwrap();
            }
            run_request_loop(&mut session, &cancel).unwrap()
        };
        let coils = store.bank(BankKind::DiscreteOutputs).bytes().to_vec();
        (outcome, coils)
    });
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (addr, handle)
}

fn transact(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
    stream.write_all(request).unwrap();
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).unwrap();
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).unwrap();
    let mut frame = header.to_vec();
    frame.extend_from_slice(&pdu);
    frame
}

fn capacities(coils: usize, inputs: usize) -> Capacities {
    Capacities {
        discrete_outputs: coils,
        discrete_inputs: 4,
        analog_outputs: 4,
        analog_inputs: inputs,
    }
}

#[test]
fn test_external_coil_write_is_visible_to_the_master() {
    let (addr, handle) = spawn_bridge(
        capacities(10, 0),
        None,
        |store| store.bank_mut(BankKind::DiscreteOutputs).bytes_mut()[3] |= 0x01,
        CancelToken::new(),
    );

    let mut master = TcpStream::connect(addr).unwrap();
    master.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Read coils 0..10 of unit 1.
    let response = transact(
        &mut master,
        &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x0A],
    );
    assert_eq!(
        response,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x01, 0x02, 0x08, 0x00]
    );

    // Input registers bank is empty: any read is an address exception.
    let response = transact(
        &mut master,
        &[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01],
    );
    assert_eq!(&response[7..], &[0x84, 0x02]);

    drop(master);
    let (outcome, _) = handle.join().unwrap();
    assert_eq!(outcome, LoopOutcome::PeerClosed);
}

#[test]
fn test_master_writes_land_in_shared_memory() {
    let (addr, handle) = spawn_bridge(
        capacities(8, 1),
        None,
        |store| store.bank_mut(BankKind::DiscreteOutputs).bytes_mut()[5] = 0xA0,
        CancelToken::new(),
    );

    let mut master = TcpStream::connect(addr).unwrap();
    master.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Write single coil 5 = ON.
    let request = [0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x05, 0xFF, 0x00];
    assert_eq!(transact(&mut master, &request), request.to_vec());

    drop(master);
    let (outcome, coils) = handle.join().unwrap();
    assert_eq!(outcome, LoopOutcome::PeerClosed);
    assert_eq!(coils[5], 0xA1);
    assert!(coils.iter().enumerate().all(|(i, c)| i == 5 || *c == 0));
}

#[test]
fn test_guarded_session_answers_and_releases() {
    let semaphore = unique("sem");
    let (addr, handle) = spawn_bridge(
        capacities(4, 1),
        Some(semaphore.clone()),
        |_| {},
        CancelToken::new(),
    );

    let mut master = TcpStream::connect(addr).unwrap();
    master.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    for id in 0..3u8 {
        let response = transact(
            &mut master,
            &[0x00, id, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x04],
        );
        assert_eq!(&response[7..9], &[0x03, 0x08]);
    }

    drop(master);
    let (outcome, _) = handle.join().unwrap();
    assert_eq!(outcome, LoopOutcome::PeerClosed);

    // The token was handed back: an external process can take it now.
    let mut external = AccessGuard::open(&semaphore, true, 0o600).unwrap();
    assert!(external.acquire().unwrap());
    external.release().unwrap();
    drop(external);
    let _ = modbus_shm::sync::semaphore::unlink(&semaphore);
}

#[test]
fn test_cancel_interrupts_a_blocked_receive() {
    let cancel = CancelToken::new();
    let (addr, handle) = spawn_bridge(capacities(1, 1), None, |_| {}, cancel.clone());

    let master = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();

    let (outcome, _) = handle.join().unwrap();
    assert_eq!(outcome, LoopOutcome::Cancelled);
    drop(master);
}
