mod common;

use std::time::{Duration, Instant};

use common::{LOOPBACK, Outcome, ScriptedStack, fast_config, recording_factory, wait_until};
use multipath_shim::{Error, MultipathBinder, PathRegistry};

const SETTLE: Duration = Duration::from_secs(5);

fn binder(registry: &PathRegistry) -> MultipathBinder {
    let (factory, _state) = recording_factory();
    MultipathBinder::new(registry.clone())
        .with_config(fast_config())
        .with_transport_factory(factory)
}

#[test]
fn listen_succeeds_with_one_path_and_retries_the_rest() {
    let a = ScriptedStack::new().listens(&[Outcome::AddrInUse], Outcome::Succeed).shared();
    let b = ScriptedStack::new().shared();
    let registry = PathRegistry::new();
    registry.register("a", a.clone());
    registry.register("b", b.clone());

    let listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    assert_eq!(listener.local_addr().port(), 8000);
    assert_eq!(b.listen_calls(), [8001]);

    assert!(wait_until(SETTLE, || listener.bound_paths() == ["a", "b"]));
    assert_eq!(a.listen_calls(), [8000, 8000]);
}

#[test]
fn listen_fails_with_first_sorted_error_when_nothing_binds() {
    let registry = PathRegistry::new();
    registry.register("b", ScriptedStack::new().listens(&[], Outcome::TimedOut).shared());
    registry.register("a", ScriptedStack::new().listens(&[], Outcome::AddrInUse).shared());

    let err = binder(&registry).listen(LOOPBACK, 8000).expect_err("nothing binds");
    assert!(matches!(err, Error::AddressInUse), "got {err:?}");
}

#[test]
fn listen_on_empty_registry_is_an_internal_error() {
    let err = binder(&PathRegistry::new())
        .listen(LOOPBACK, 8000)
        .expect_err("no paths");
    assert!(matches!(err, Error::Internal(_)), "got {err:?}");
}

#[test]
fn accept_reports_the_logical_remote_port() {
    // Path a has nothing pending on the first pass; b accepts the peer's
    // second path, which the peer opened from 7000 + 1.
    let a = ScriptedStack::new()
        .accepts(&[Outcome::WouldBlock], Outcome::Succeed)
        .remote_port(7000)
        .shared();
    let b = ScriptedStack::new().remote_port(7001).shared();
    let c = ScriptedStack::new()
        .accepts(&[Outcome::WouldBlock], Outcome::Succeed)
        .remote_port(7002)
        .shared();
    let registry = PathRegistry::new();
    registry.register("a", a);
    registry.register("b", b);
    registry.register("c", c);

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    let (ip, port, stream) = listener.accept().expect("accept");
    assert_eq!(ip, LOOPBACK);
    assert_eq!(port, 7000);
    assert_eq!(stream.peer_addr().port(), 7000);
    assert_eq!(stream.local_addr().port(), 8000);

    assert!(wait_until(SETTLE, || stream.connected_paths() == ["a", "b", "c"]));
}

#[test]
fn accept_without_pending_connections_would_block() {
    let a = ScriptedStack::new().accepts(&[], Outcome::WouldBlock).shared();
    let registry = PathRegistry::new();
    registry.register("a", a.clone());
    registry.register("b", ScriptedStack::new().accepts(&[], Outcome::WouldBlock).shared());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    assert!(matches!(listener.accept(), Err(Error::WouldBlock)));
    assert_eq!(a.accept_calls(), 1);
}

#[test]
fn accept_timeout_gives_up_at_the_deadline() {
    let registry = PathRegistry::new();
    registry.register("a", ScriptedStack::new().accepts(&[], Outcome::WouldBlock).shared());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    let start = Instant::now();
    let err = listener
        .accept_timeout(Some(Duration::from_millis(50)))
        .expect_err("nobody connects");
    assert!(matches!(err, Error::TimedOut), "got {err:?}");
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn accept_timeout_waits_for_a_late_connection() {
    let registry = PathRegistry::new();
    registry.register(
        "a",
        ScriptedStack::new()
            .accepts(&[Outcome::WouldBlock, Outcome::WouldBlock], Outcome::Succeed)
            .remote_port(4242)
            .shared(),
    );

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    let (_, port, _stream) = listener
        .accept_timeout(Some(Duration::from_secs(5)))
        .expect("third attempt accepts");
    assert_eq!(port, 4242);
}

#[test]
fn close_is_idempotent_and_stops_accepting() {
    let a = ScriptedStack::new().shared();
    let b = ScriptedStack::new().shared();
    let registry = PathRegistry::new();
    registry.register("a", a.clone());
    registry.register("b", b.clone());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    assert!(listener.close());
    assert!(!listener.close());
    assert!(listener.is_closed());
    assert!(listener.bound_paths().is_empty());
    assert_eq!(a.closed_listeners() + b.closed_listeners(), 2);
    assert!(matches!(listener.accept(), Err(Error::ClosedLocally)));
}

#[test]
fn accepted_stream_outlives_its_listener() {
    let registry = PathRegistry::new();
    registry.register("a", ScriptedStack::new().shared());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    let (_, _, mut stream) = listener.accept().expect("accept");
    drop(listener);

    stream.send(b"still here").expect("send");
    assert_eq!(stream.connected_paths(), ["a"]);
}

#[test]
fn background_accept_stops_once_listener_closes() {
    let b = ScriptedStack::new()
        .accepts(&[Outcome::Succeed], Outcome::WouldBlock)
        .shared();
    let registry = PathRegistry::new();
    registry.register("a", ScriptedStack::new().shared());
    registry.register("b", b.clone());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    // Consume b's single connection with a first stream.
    let (_, _, _first) = listener.accept().expect("accept");
    let (_, _, second) = listener.accept().expect("accept");
    assert_eq!(second.connected_paths(), ["a"]);

    assert!(wait_until(SETTLE, || b.accept_calls() >= 4));
    listener.close();
    let at_close = b.accept_calls();
    std::thread::sleep(Duration::from_millis(100));
    assert!(b.accept_calls() <= at_close + 1);
    assert_eq!(second.connected_paths(), ["a"]);
}

#[test]
fn listener_closed_locally_is_left_out_of_accepted_streams() {
    let b = ScriptedStack::new().listens(&[], Outcome::ClosedLocally).shared();
    let registry = PathRegistry::new();
    registry.register("a", ScriptedStack::new().shared());
    registry.register("b", b.clone());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    assert_eq!(listener.bound_paths(), ["a"]);
    let (_, _, stream) = listener.accept().expect("accept");
    assert_eq!(stream.path_count(), 1);
    assert_eq!(stream.connected_paths(), ["a"]);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(b.listen_calls(), [8001]);
    assert_eq!(b.accept_calls(), 0);
}

#[test]
fn listener_closed_locally_during_retries_leaves_accepted_stream() {
    let b = ScriptedStack::new()
        .listens(&[Outcome::Refused], Outcome::ClosedLocally)
        .shared();
    let registry = PathRegistry::new();
    registry.register("a", ScriptedStack::new().shared());
    registry.register("b", b.clone());

    let mut listener = binder(&registry).listen(LOOPBACK, 8000).expect("listen");
    let (_, _, stream) = listener.accept().expect("accept");

    assert!(wait_until(SETTLE, || stream.path_count() == 1));
    assert_eq!(stream.connected_paths(), ["a"]);
    assert_eq!(b.listen_calls(), [8001, 8001]);
    assert_eq!(b.accept_calls(), 0);
}
