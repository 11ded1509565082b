mod tls_test_helper;

use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::time::{Duration, Instant};
use tlsedge::prelude::*;
use tlsedge::role;
use tls_test_helper::{generate_test_tls_config, test_harness};

#[test]
fn survives_connect_close_churn() {
    let (harness, _guard) = test_harness();
    let mut listener = harness.listen().unwrap();
    listener.set_handshake_timeout(Some(Duration::from_secs(5)));
    let addr = SocketAddr::from(([127, 0, 0, 1], listener.port()));
    let closer = listener.closer();

    let acceptor = role::spawn("churned-acceptor", move |ready| {
        ready.signal();
        let mut failed = 0usize;
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let mut buf = [0u8; 4];
                    stream.recv_exact(&mut buf)?;
                    stream.send_all(&buf)?;
                    stream.close()?;
                    return Ok(failed);
                }
                Err(err) if err.kind() == ErrorKind::ListenerClosed => return Err(err),
                Err(_) => failed += 1,
            }
        }
    })
    .unwrap();

    for _ in 0..150 {
        drop(TcpStream::connect(addr).unwrap());
    }

    let mut client = harness
        .connect(addr.port(), Some(Duration::from_secs(10)))
        .unwrap();
    client.send_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    client.recv_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    client.close().unwrap();

    let failed = acceptor.join().unwrap();
    assert!(failed <= 150);
    closer.close();
}

#[test]
fn closer_wakes_pending_accept() {
    let (harness, _guard) = test_harness();
    let mut listener = harness.listen().unwrap();
    let closer = listener.closer();
    let port = listener.port();

    let mut acceptor = role::spawn("blocked-acceptor", move |ready| {
        ready.signal();
        listener.accept().map(|_| ())
    })
    .unwrap();
    acceptor.wait_ready(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    closer.close();
    closer.close();
    assert!(closer.is_closed());

    let err = acceptor.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ListenerClosed);

    // The acceptor dropped the listener, so nothing listens any more.
    let err = TcpStream::connect(("127.0.0.1", port)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
}

#[test]
fn accept_honours_its_blocking_mode() {
    let (harness, _guard) = test_harness();
    let mut listener = harness.listen().unwrap();

    listener.set_mode(BlockingMode::NonBlocking);
    let err = listener.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);

    listener.set_mode(BlockingMode::Timeout(Duration::from_millis(50)));
    let start = Instant::now();
    let err = listener.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn bind_failure_is_a_setup_error() {
    let (config, _guard) = generate_test_tls_config();
    let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let err = tlsedge::create_secure_listener(
        &addr.to_string(),
        &config.get_string("tls_server_cert").unwrap(),
        &config.get_string("tls_server_key").unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Bind { .. }), "unexpected error: {err}");
    assert_eq!(err.kind(), ErrorKind::Setup);
}

#[test]
fn ephemeral_port_is_reported() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    assert_ne!(listener.port(), 0);
    assert_eq!(listener.local_addr().port(), listener.port());
    listener.close();
}

#[test]
fn missing_certificate_is_a_setup_error() {
    let err = tlsedge::create_secure_listener(
        "127.0.0.1:0",
        "/nonexistent/cert.pem",
        "/nonexistent/key.pem",
    )
    .unwrap_err();
    assert!(matches!(err, Error::TlsCertificateLoad { .. }));
    assert_eq!(err.kind(), ErrorKind::Setup);
}
