//! End-to-end registry scenarios over real sockets.
//!
//! Covers: readiness of an accepted unix connection, removal, empty-registry
//! timeout, wake-up of a blocked `get` by a concurrent `add`, cleanup of the
//! unix socket path, and identity-preserving reconnect under registration.

use sockpool::dial;
use sockpool::{ActiveConnection, Address, ConnectionRegistry, Error, Interest, PassiveSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn socket_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// Accepted server side plus client side of one unix connection.
fn unix_pair(listener: &PassiveSocket) -> (ActiveConnection, ActiveConnection) {
    let client = dial::connect(listener.address()).unwrap();
    let server = listener.accept().unwrap();
    (server, client)
}

// ============================================================================
// Readiness
// ============================================================================

#[test]
fn readable_accepted_connection_then_remove() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::unix(socket_path(&dir, "ready.sock"));
    let listener = PassiveSocket::bind(&address, 8).unwrap();
    let registry = ConnectionRegistry::new(4).unwrap();

    let (a, b) = unix_pair(&listener);
    let id = registry.add(a, Interest::READABLE).unwrap();

    b.write_all(&[1, 2, 3]).unwrap();
    let batch = registry.get(Some(Duration::from_millis(1000))).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id(), id);
    assert!(batch[0].events.is_readable());

    registry.remove(id).unwrap();
    // Consume the wake-ups left by add and remove.
    let _ = registry.get(Some(Duration::from_millis(10))).unwrap();
    let batch = registry.get(Some(Duration::from_millis(100))).unwrap();
    assert!(batch.is_empty());
}

#[test]
fn empty_registry_waits_for_timeout() {
    let registry = ConnectionRegistry::new(4).unwrap();
    let start = Instant::now();
    let batch = registry.get(Some(Duration::from_millis(50))).unwrap();
    let elapsed = start.elapsed();
    assert!(batch.is_empty());
    assert!(elapsed >= Duration::from_millis(45), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
}

#[test]
fn only_ready_connections_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let listener = PassiveSocket::bind(&Address::unix(socket_path(&dir, "sel.sock")), 8).unwrap();
    let registry = ConnectionRegistry::new(8).unwrap();

    let mut peers = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let (server, client) = unix_pair(&listener);
        ids.push(registry.add(server, Interest::READABLE).unwrap());
        peers.push(client);
    }
    let _ = registry.get(Some(Duration::from_millis(10))).unwrap();

    peers[1].write_all(b"a").unwrap();
    peers[3].write_all(b"b").unwrap();
    let mut seen: Vec<_> = registry
        .get(Some(Duration::from_secs(1)))
        .unwrap()
        .into_iter()
        .map(|ready| ready.id())
        .collect();
    seen.sort();
    let mut expected = vec![ids[1], ids[3]];
    expected.sort();
    assert_eq!(seen, expected);
}

// ============================================================================
// Wake-up
// ============================================================================

#[test]
fn add_from_other_thread_wakes_indefinite_get() {
    let registry = Arc::new(ConnectionRegistry::new(4).unwrap());
    let (a, b) = ActiveConnection::pair().unwrap();
    b.write_all(b"ready").unwrap();
    let id = a.id();

    let adder = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            registry.add(a, Interest::READABLE).unwrap();
        })
    };

    let start = Instant::now();
    let mut batch = registry.get(None).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    adder.join().unwrap();

    if batch.is_empty() {
        batch = registry.get(Some(Duration::from_secs(1))).unwrap();
    }
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id(), id);
}

#[test]
fn concurrent_adds_and_removes_keep_count_consistent() {
    let registry = Arc::new(ConnectionRegistry::new(64).unwrap());
    let poller = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..50 {
                registry.get(Some(Duration::from_millis(5))).unwrap();
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for round in 0..8 {
                    let (a, b) = ActiveConnection::pair().unwrap();
                    let id = registry.add(a, Interest::READABLE).unwrap();
                    if round % 2 == 0 {
                        registry.remove(id).unwrap();
                    } else {
                        kept.push(b);
                    }
                }
                kept
            })
        })
        .collect();

    let peers: Vec<_> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();
    poller.join().unwrap();
    assert_eq!(registry.len(), 16);
    assert_eq!(peers.len(), 16);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn unix_listener_path_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir, "cleanup.sock");
    let listener = PassiveSocket::bind(&Address::unix(&path), 4).unwrap();
    assert!(path.exists());
    drop(listener);
    assert!(!path.exists());
}

#[test]
fn removed_connection_closes_when_last_reference_drops() {
    let registry = ConnectionRegistry::new(2).unwrap();
    let (a, b) = ActiveConnection::pair().unwrap();
    let id = registry.add(a, Interest::READABLE).unwrap();

    let conn = registry.remove(id).unwrap();
    conn.write_all(b"last").unwrap();
    drop(conn);

    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut &b, &mut out).unwrap();
    assert_eq!(out, b"last");
}

#[test]
fn reconnect_preserves_registered_identity() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::unix(socket_path(&dir, "re.sock"));
    let listener = PassiveSocket::bind(&address, 4).unwrap();
    let registry = ConnectionRegistry::new(2).unwrap();

    let mut client = dial::connect(&address).unwrap();
    let _first = listener.accept().unwrap();
    let id = client.id();

    dial::reconnect(&mut client).unwrap();
    let second = listener.accept().unwrap();
    assert_eq!(client.id(), id);

    registry.add(client, Interest::READABLE).unwrap();
    second.write_all(b"z").unwrap();
    let batch = registry.get(Some(Duration::from_secs(1))).unwrap();
    assert!(batch.iter().any(|ready| ready.id() == id && ready.events.is_readable()));
}

#[test]
fn dial_errors_carry_errno() {
    let dir = tempfile::tempdir().unwrap();
    let err = dial::connect(&Address::unix(socket_path(&dir, "none.sock"))).unwrap_err();
    assert!(err.raw_os_error().is_some());
    match err {
        Error::Os { op, source } => {
            assert_eq!(op, "connect");
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other}"),
    }
}
