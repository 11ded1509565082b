mod tls_test_helper;

use std::net::TcpListener as StdTcpListener;
use std::time::{Duration, Instant};
use tlsedge::prelude::*;
use tlsedge::role;
use tls_test_helper::{test_harness, untrusted_harness};

fn accept_one(mut listener: SecureListener) -> role::RoleHandle<SecureStream> {
    role::spawn("test-acceptor", move |ready| {
        ready.signal();
        let (stream, _) = listener.accept()?;
        Ok(stream)
    })
    .unwrap()
}

#[test]
fn round_trip_is_exact_with_clean_eof() {
    let (harness, _guard) = test_harness();
    let mut listener = harness.listen().unwrap();
    let port = listener.port();

    let receiver = role::spawn("receiver", move |ready| {
        ready.signal();
        let (mut stream, _) = listener.accept()?;
        let mut bytes = Vec::new();
        stream.recv_to_end(&mut bytes)?;
        stream.close()?;
        Ok(bytes)
    })
    .unwrap();

    let payload = Payload::with_head(b"head\r\n", b"0123456789abcdef", 64 * 1024);
    let mut client = harness.connect(port, None).unwrap();
    assert_eq!(client.mode(), BlockingMode::Blocking);
    client.send_payload(&payload).unwrap();
    client.close().unwrap();

    let bytes = receiver.join().unwrap();
    assert_eq!(bytes.len(), payload.len());
    assert!(payload.matches(&bytes));
}

#[test]
fn nonblocking_send_never_reports_full_length() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    let port = listener.port();
    let acceptor = accept_one(listener);

    let mut client = harness.connect(port, None).unwrap();
    let server = acceptor.join().unwrap();
    client.set_nonblocking(true);

    let big = vec![b'x'; 32 * 1024 * 1024];
    let start = Instant::now();
    let mut total = 0;
    let err = loop {
        match client.send(&big[total..]) {
            Ok(n) => {
                assert!(n > 0);
                assert!(n < big.len() - total, "send claimed {n} bytes at once");
                total += n;
            }
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert!(total < big.len());
    assert!(start.elapsed() < Duration::from_secs(30));

    // The stream stays usable after the error.
    assert_eq!(client.mode(), BlockingMode::NonBlocking);
    client.close().unwrap();
    drop(server);
}

#[test]
fn timed_recv_times_out_and_stream_survives() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    let port = listener.port();
    let acceptor = accept_one(listener);

    let mut client = harness.connect(port, None).unwrap();
    let mut server = acceptor.join().unwrap();

    server.set_timeout(Some(Duration::from_millis(50)));
    let mut buf = [0u8; 16];
    let start = Instant::now();
    let err = server.recv(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(50));

    client.send_all(b"late").unwrap();
    server.set_timeout(None);
    server.recv_exact(&mut buf[..4]).unwrap();
    assert_eq!(&buf[..4], b"late");

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn nonblocking_recv_would_block() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    let port = listener.port();
    let acceptor = accept_one(listener);

    let mut client = harness.connect(port, None).unwrap();
    let _server = acceptor.join().unwrap();

    client.set_nonblocking(true);
    let mut buf = [0u8; 16];
    let err = client.recv(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}

#[test]
fn handshake_timeout_is_set_before_the_handshake() {
    let (harness, _guard) = test_harness();
    // Completes the TCP handshake from its backlog but never speaks TLS.
    let silent = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();

    let start = Instant::now();
    let err = harness
        .connect(port, Some(Duration::from_millis(200)))
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[test]
fn peer_closing_mid_handshake_is_a_handshake_error() {
    let (harness, _guard) = test_harness();
    let raw = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let port = raw.local_addr().unwrap().port();

    let closer = std::thread::spawn(move || {
        let (stream, _) = raw.accept().unwrap();
        drop(stream);
    });

    let err = harness
        .connect(port, Some(Duration::from_secs(5)))
        .unwrap_err();
    assert_eq!(
        Some(err.kind()),
        tlsedge::expected_kind(
            BlockingMode::Timeout(Duration::from_secs(5)),
            Condition::PeerClosedDuringHandshake
        ),
        "unexpected error: {err}"
    );
    closer.join().unwrap();
}

#[test]
fn untrusted_certificate_fails_the_handshake() {
    let (harness, _guard, _other_ca) = untrusted_harness();
    let mut listener = harness.listen().unwrap();
    listener.set_handshake_timeout(Some(Duration::from_secs(5)));
    let port = listener.port();
    let acceptor = role::spawn("rejecting-acceptor", move |ready| {
        ready.signal();
        listener.accept().map(|_| ())
    })
    .unwrap();

    let err = harness
        .connect(port, Some(Duration::from_secs(5)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);

    let err = acceptor.join().unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Handshake | ErrorKind::ConnectionReset
    ));
}

#[test]
fn connect_to_closed_port_is_refused() {
    let (harness, _guard) = test_harness();
    let port = {
        let raw = StdTcpListener::bind("127.0.0.1:0").unwrap();
        raw.local_addr().unwrap().port()
    };

    let err = harness
        .connect(port, Some(Duration::from_secs(5)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}

#[test]
fn timed_send_retry_delivers_each_byte_once() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    let port = listener.port();
    let acceptor = accept_one(listener);

    let mut client = harness.connect(port, None).unwrap();
    let mut server = acceptor.join().unwrap();

    // 17-byte unit, so a resent or skipped window shows up as a mismatch.
    let payload = Payload::repeated(b"0123456789abcdefg", 2_000_000);
    let buf = payload.to_vec();
    let timeout = Duration::from_millis(100);
    client.set_timeout(Some(timeout));

    let mut total = 0;
    let err = loop {
        match client.send(&buf[total..]) {
            Ok(n) => total += n,
            Err(err) => break err,
        }
    };
    assert_eq!(
        Some(err.kind()),
        tlsedge::expected_kind(BlockingMode::Timeout(timeout), Condition::DeadlineExceeded),
        "unexpected error: {err}"
    );
    assert!(total < buf.len());

    let reader = role::spawn("late-reader", move |ready| {
        ready.signal();
        server.set_timeout(None);
        let mut bytes = Vec::new();
        server.recv_to_end(&mut bytes)?;
        server.close()?;
        Ok(bytes)
    })
    .unwrap();

    client.set_timeout(None);
    client.send_all(&buf[total..]).unwrap();
    client.close().unwrap();

    let bytes = reader.join().unwrap();
    assert_eq!(payload.first_mismatch(&bytes), None);
    assert_eq!(bytes.len(), payload.len());
}

#[test]
fn timed_send_into_stalled_peer_delivers_a_strict_prefix() {
    let (harness, _guard) = test_harness();
    let mut listener = harness.listen().unwrap();
    let port = listener.port();
    let timeout = Duration::from_millis(100);
    let stall = Duration::from_millis(500);

    let receiver = role::spawn("stalled-receiver", move |ready| {
        ready.signal();
        let (mut stream, _) = listener.accept()?;
        std::thread::sleep(stall);
        let mut bytes = Vec::new();
        match stream.recv_to_end(&mut bytes) {
            Ok(()) => {}
            Err(err) if matches!(err.kind(), ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset) => {}
            Err(err) => return Err(err),
        }
        Ok(bytes)
    })
    .unwrap();

    let payload = Payload::with_head(b"POST /upload HTTP/1.0\r\n\r\n", b"0123456789abcdefg", 2_000_000);
    let mut client = harness.connect(port, None).unwrap();
    client.set_timeout(Some(timeout));
    let err = client.send_payload(&payload).unwrap_err();

    let expected =
        ExpectedOutcome::for_condition(BlockingMode::Timeout(timeout), Condition::DeadlineExceeded)
            .unwrap();
    assert_eq!(expected, ExpectedOutcome::TimeoutError);
    expected.check_error("timed_send", &err).unwrap();
    client.close().unwrap();

    let bytes = receiver.join().unwrap();
    expected.check_bytes("timed_send", &payload, &bytes).unwrap();
    assert!(bytes.len() < payload.len());
}

#[test]
fn negotiated_protocol_is_reported() {
    let (harness, _guard) = test_harness();
    let listener = harness.listen().unwrap();
    let port = listener.port();
    let acceptor = accept_one(listener);

    let client = harness.connect(port, None).unwrap();
    let server = acceptor.join().unwrap();
    assert!(client.protocol_version().is_some());
    assert_eq!(client.protocol_version(), server.protocol_version());

    client.close().unwrap();
    server.close().unwrap();
}
