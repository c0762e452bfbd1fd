//! End-to-end tests over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use wirecall::{
    BackendKind, CallError, ClientChannel, ClientOptions, ReactorOptions, RpcServer, Scheduler,
    ServerOptions, ServiceRegistry,
};

fn echo_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register("EchoService", "Echo", |message: String| {
        format!("[Echo]{message}")
    });
    registry
}

fn server_options(backend: BackendKind) -> ServerOptions {
    ServerOptions {
        listen: "127.0.0.1:0".parse().unwrap(),
        backend,
        workers: 1,
        ..ServerOptions::default()
    }
}

fn client(addr: std::net::SocketAddr, backend: BackendKind) -> (Scheduler, ClientChannel) {
    let scheduler = Scheduler::start(backend, 1, &ReactorOptions::default()).unwrap();
    let channel =
        ClientChannel::connect(addr, &ClientOptions::default(), scheduler.executor()).unwrap();
    (scheduler, channel)
}

#[test]
fn echo_round_trip() {
    let handle = RpcServer::new(server_options(BackendKind::Poll), echo_registry())
        .start()
        .unwrap();
    let (scheduler, channel) = client(handle.local_addr(), BackendKind::Poll);

    let response: String = channel
        .call_timeout("EchoService", "Echo", &"ping".to_string(), Duration::from_secs(10))
        .unwrap();
    assert_eq!(response, "[Echo]ping");

    channel.close();
    scheduler.shutdown();
    handle.shutdown();
}

#[test]
fn concurrent_calls_multiplex_over_one_connection() {
    let handle = RpcServer::new(server_options(BackendKind::Poll), echo_registry())
        .start()
        .unwrap();
    let (scheduler, channel) = client(handle.local_addr(), BackendKind::Poll);

    let n = 32;
    let (tx, rx) = mpsc::channel();
    for i in 0..n {
        let tx = tx.clone();
        let message = format!("msg-{i}");
        channel
            .call_with("EchoService", "Echo", &message, move |result| {
                let _ = tx.send((i, result));
            })
            .unwrap();
    }
    drop(tx);

    let mut seen = vec![false; n];
    for _ in 0..n {
        let (i, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let payload = result.unwrap();
        assert_eq!(payload, format!("[Echo]msg-{i}").into_bytes());
        assert!(!seen[i], "completion delivered twice");
        seen[i] = true;
    }
    assert!(seen.iter().all(|&s| s));
    assert_eq!(channel.stray_responses(), 0);

    channel.close();
    scheduler.shutdown();
    handle.shutdown();
}

#[test]
fn large_payloads_cross_block_boundaries() {
    let handle = RpcServer::new(server_options(BackendKind::Poll), echo_registry())
        .start()
        .unwrap();
    let (scheduler, channel) = client(handle.local_addr(), BackendKind::Poll);

    for size in [8191usize, 8192, 8193, 100_000] {
        let message: String = "x".repeat(size);
        let response: String = channel
            .call_timeout("EchoService", "Echo", &message, Duration::from_secs(10))
            .unwrap();
        assert_eq!(response.len(), size + "[Echo]".len());
        assert!(response.starts_with("[Echo]"));
    }

    channel.close();
    scheduler.shutdown();
    handle.shutdown();
}

#[test]
fn sequential_calls_reuse_the_connection() {
    let handle = RpcServer::new(server_options(BackendKind::Poll), echo_registry())
        .start()
        .unwrap();
    let (scheduler, channel) = client(handle.local_addr(), BackendKind::Poll);

    for i in 0..50 {
        let response: String = channel
            .call_timeout(
                "EchoService",
                "Echo",
                &format!("seq-{i}"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(response, format!("[Echo]seq-{i}"));
    }

    channel.close();
    scheduler.shutdown();
    handle.shutdown();
}

#[test]
fn closing_a_channel_fails_every_pending_call() {
    // A server that accepts and then stays silent, so calls stay in flight.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    std::thread::spawn(move || {
        let accepted = listener.accept();
        // Keep the socket open until the test ends (sender drop).
        let _ = hold_rx.recv_timeout(Duration::from_secs(30));
        drop(accepted);
    });

    let (scheduler, channel) = client(addr, BackendKind::Poll);

    let k = 7;
    let failures = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..k {
        let failures = Arc::clone(&failures);
        let tx = tx.clone();
        channel
            .call_with("EchoService", "Echo", &"never".to_string(), move |result| {
                assert_eq!(result, Err(CallError::ConnectionClosed));
                failures.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .unwrap();
    }
    drop(tx);

    channel.close();
    for _ in 0..k {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), k);

    scheduler.shutdown();
    drop(hold_tx);
}

#[cfg(target_os = "linux")]
#[test]
fn echo_round_trip_uring() {
    // io_uring may be unavailable in sandboxes and old kernels; skip cleanly.
    let scheduler = match Scheduler::start(BackendKind::Uring, 1, &ReactorOptions::default()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("skipping: io_uring unavailable: {e}");
            return;
        }
    };

    let handle = match RpcServer::new(server_options(BackendKind::Uring), echo_registry()).start()
    {
        Ok(h) => h,
        Err(e) => {
            eprintln!("skipping: io_uring unavailable: {e}");
            return;
        }
    };

    let channel = ClientChannel::connect(
        handle.local_addr(),
        &ClientOptions::default(),
        scheduler.executor(),
    )
    .unwrap();

    for i in 0..10 {
        let response: String = channel
            .call_timeout(
                "EchoService",
                "Echo",
                &format!("ring-{i}"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(response, format!("[Echo]ring-{i}"));
    }

    channel.close();
    scheduler.shutdown();
    handle.shutdown();
}
