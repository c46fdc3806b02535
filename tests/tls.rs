//! TLS handshakes, shared credentials and proxy tunnels.
//!
//! # Running with tracing
//!
//! ```bash
//! TEST_LOG=2 cargo test --test tls -- --nocapture
//! ```


use comstack::prelude::*;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::Duration;
use tls_test_helper::generate_test_tls_options;

static INIT: Once = Once::new();

/// Initialize tracing based on TEST_LOG environment variable
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("comstack={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

fn len_prefixed(buf: &[u8]) -> usize {
    let Some(rest) = buf.strip_prefix(b"LEN:") else {
        return 0;
    };
    let Some(colon) = rest.iter().position(|&b| b == b':') else {
        return 0;
    };
    let Some(n) = std::str::from_utf8(&rest[..colon])
        .ok()
        .and_then(|digits| digits.parse::<usize>().ok())
    else {
        return 0;
    };
    let total = 4 + colon + 1 + n;
    if buf.len() >= total {
        total
    } else {
        0
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("LEN:{}:", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

fn tls_listener(options: Options) -> (Connection, SocketAddr) {
    let mut listener = Connection::new(options, Protocol::Z3950);
    listener
        .bind("127.0.0.1:0", BindMode::Server)
        .expect("Failed to bind TLS listener");
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Drives a client connect and the server side of the same connection from
/// one thread until both handshakes are done.
fn establish(client: &mut Connection, listener: &mut Connection, spec: &str) -> Connection {
    let mut client_progress = client.connect(spec).expect("Failed to start connect");
    let mut child: Option<Connection> = None;
    let mut child_done = false;

    for _ in 0..5000 {
        if let Progress::InProgress(_) = client_progress {
            client_progress = client.resume_connect().expect("Client handshake failed");
        }

        match child.as_mut() {
            None => {
                if let Listen::Incoming(_) = listener.listen().unwrap() {
                    let Accept::Incoming(accepted) = listener.accept().unwrap() else {
                        panic!("listener did not hand out a connection");
                    };
                    assert_eq!(accepted.state(), State::Accepting);
                    child = Some(accepted);
                }
            }
            Some(accepted) if !child_done => {
                child_done = match accepted.accept().expect("Server handshake failed") {
                    Accept::Done => true,
                    Accept::InProgress(_) => false,
                    Accept::Incoming(_) => panic!("accepted connection handed out another"),
                };
            }
            Some(_) => {}
        }

        if client_progress == Progress::Done && child_done {
            assert_eq!(client.state(), State::DataTransfer);
            let child = child.unwrap();
            assert_eq!(child.state(), State::DataTransfer);
            return child;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("handshake did not finish");
}

/// Sends `data` from `from` and receives it on `to`, interleaving both sides
/// so large payloads cannot deadlock on full socket buffers.
fn transfer(from: &mut Connection, to: &mut Connection, data: &[u8]) -> Vec<u8> {
    let mut sent = false;
    for _ in 0..10000 {
        if !sent {
            sent = from.put(data).unwrap() == Progress::Done;
        }
        match to.get().unwrap() {
            Frame::Message(_) => {
                assert!(sent, "message complete before put finished");
                return to.message().to_vec();
            }
            Frame::Incomplete(_) => thread::sleep(Duration::from_millis(1)),
            Frame::Closed => panic!("peer closed the stream"),
        }
    }
    panic!("transfer did not finish");
}

/// Minimal HTTP proxy: reads one CONNECT request, answers with `status`,
/// and on success relays bytes to `upstream`. Returns the request head.
fn spawn_proxy(
    status: &'static str,
    upstream: Option<SocketAddr>,
) -> (SocketAddr, thread::JoinHandle<String>) {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = proxy.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut client, _) = proxy.accept().unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        client
            .write_all(format!("HTTP/1.1 {status}\r\nProxy-Agent: test\r\n\r\n").as_bytes())
            .unwrap();

        if let Some(upstream) = upstream {
            let mut server = TcpStream::connect(upstream).unwrap();
            let mut client_reader = client.try_clone().unwrap();
            let mut server_writer = server.try_clone().unwrap();
            thread::spawn(move || {
                let _ = io::copy(&mut client_reader, &mut server_writer);
                let _ = server_writer.shutdown(Shutdown::Write);
            });
            thread::spawn(move || {
                let _ = io::copy(&mut server, &mut client);
                let _ = client.shutdown(Shutdown::Write);
            });
        }
        String::from_utf8(head).unwrap()
    });
    (addr, handle)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn tls_handshake_and_exchange() {
    init_tracing();
    let (options, _guard) = generate_test_tls_options();
    assert_eq!(options.transport, TransportKind::Tls);

    let (mut listener, addr) = tls_listener(options.clone());
    let mut client = Connection::new(options, Protocol::Z3950);
    client.set_completion(len_prefixed);

    let mut child = establish(&mut client, &mut listener, &format!("ssl:{addr}"));
    child.set_completion(len_prefixed);

    assert_eq!(client.transport(), TransportKind::Tls);
    assert_eq!(client.peer_address().as_deref(), Some("ssl:127.0.0.1"));
    let server_cert = client.peer_certificate().expect("server presented a certificate");
    assert!(!server_cert.is_empty());
    assert_eq!(child.peer_certificate(), None, "no client authentication");

    let request = frame(b"hello over tls");
    assert_eq!(transfer(&mut client, &mut child, &request), request);

    // Larger than a TLS record, so put() sees partial progress.
    let response = frame(&vec![9u8; 300_000]);
    assert_eq!(transfer(&mut child, &mut client, &response), response);

    client.close();
    let mut closed = false;
    for _ in 0..5000 {
        match child.get().unwrap() {
            Frame::Closed => {
                closed = true;
                break;
            }
            Frame::Incomplete(_) => thread::sleep(Duration::from_millis(1)),
            Frame::Message(_) => panic!("unexpected message"),
        }
    }
    assert!(closed, "close_notify never arrived");
}

#[test]
fn supplied_socket_runs_server_handshake() {
    init_tracing();
    let (options, _guard) = generate_test_tls_options();

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = Connection::new(options.clone(), Protocol::Z3950);
    let mut client_progress = client.connect(&addr.to_string()).unwrap();
    let (accepted, _) = server.accept().unwrap();

    let mut conn = Connection::create(Some(accepted), options, Protocol::Z3950).unwrap();
    assert_eq!(conn.state(), State::Idle);
    // No plaintext on a stream that is waiting for its TLS side.
    let err = conn.put(b"plain").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfState);

    let mut server_done = conn.start_tls(BindMode::Server).unwrap() == Progress::Done;
    assert!(server_done || conn.state() == State::Accepting);
    for _ in 0..5000 {
        if let Progress::InProgress(_) = client_progress {
            client_progress = client.resume_connect().unwrap();
        }
        if !server_done {
            server_done = matches!(conn.accept().unwrap(), Accept::Done);
        }
        if server_done && client_progress == Progress::Done {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(conn.state(), State::DataTransfer);
    assert_eq!(client.state(), State::DataTransfer);

    assert_eq!(transfer(&mut client, &mut conn, b"from client"), b"from client");
}

#[test]
fn supplied_socket_runs_client_handshake() {
    init_tracing();
    let (options, _guard) = generate_test_tls_options();

    let mut listener = Connection::new(options.clone(), Protocol::Z3950);
    listener.bind("127.0.0.1:0", BindMode::Server).unwrap();
    let addr = listener.local_addr().unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    let mut client = Connection::create(Some(stream), options, Protocol::Z3950).unwrap();
    assert_eq!(client.state(), State::Idle);
    let mut client_progress = client.start_tls(BindMode::Client).unwrap();

    let mut child: Option<Connection> = None;
    let mut child_done = false;
    for _ in 0..5000 {
        if let Progress::InProgress(_) = client_progress {
            client_progress = client.resume_connect().unwrap();
        }
        match child.as_mut() {
            None => {
                if let Listen::Incoming(_) = listener.listen().unwrap() {
                    let Accept::Incoming(accepted) = listener.accept().unwrap() else {
                        panic!("listener did not hand out a connection");
                    };
                    child = Some(accepted);
                }
            }
            Some(accepted) if !child_done => {
                child_done = matches!(accepted.accept().unwrap(), Accept::Done);
            }
            Some(_) => {}
        }
        if child_done && client_progress == Progress::Done {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(client.state(), State::DataTransfer);
    assert!(client.peer_certificate().is_some());

    let mut child = child.expect("listener never accepted");
    assert_eq!(transfer(&mut child, &mut client, b"from server"), b"from server");
}

#[test]
fn credential_set_is_released_after_last_child_closes() {
    init_tracing();
    let (options, guard) = generate_test_tls_options();

    let credentials = CredentialSet::load(guard.cert_path(), guard.key_path()).unwrap();
    let weak = credentials.downgrade();

    let mut listener = Connection::new(options, Protocol::Z3950);
    listener.set_credentials(credentials);
    listener.bind("127.0.0.1:0", BindMode::Server).unwrap();
    let addr = listener.local_addr().unwrap();
    assert_eq!(weak.strong_count(), 1);

    const CHILDREN: usize = 3;
    let peers: Vec<TcpStream> = (0..CHILDREN)
        .map(|_| TcpStream::connect(addr).unwrap())
        .collect();

    let mut children = Vec::new();
    for _ in 0..5000 {
        if children.len() == CHILDREN {
            break;
        }
        match listener.listen().unwrap() {
            Listen::Incoming(_) => {
                let Accept::Incoming(child) = listener.accept().unwrap() else {
                    panic!("listener did not hand out a connection");
                };
                children.push(child);
            }
            Listen::NoDataYet => thread::sleep(Duration::from_millis(1)),
        }
    }
    assert_eq!(children.len(), CHILDREN);
    // Each child holds the set, and so does its TLS session.
    assert!(weak.strong_count() > CHILDREN);

    for mut child in children {
        child.close();
    }
    assert_eq!(weak.strong_count(), 1, "listener still holds the set");

    drop(listener);
    assert_eq!(weak.strong_count(), 0);
    assert!(weak.upgrade().is_none());
    drop(peers);
}

#[test]
fn tls_listener_without_credentials_fails_to_bind() {
    init_tracing();
    let options = Options {
        transport: TransportKind::Tls,
        ..Options::default()
    };
    let mut listener = Connection::new(options, Protocol::Z3950);
    let err = listener
        .bind("127.0.0.1:0", BindMode::Server)
        .unwrap_err();
    assert!(matches!(err, Error::TlsServerConfigMissing));
    assert_eq!(listener.look().error, Some(ErrorKind::Tls));
}

#[test]
fn tls_client_without_trust_roots_fails() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = Connection::new(Options::default(), Protocol::Z3950);
    let mut result = client.connect(&format!("ssl:{addr}"));
    for _ in 0..5000 {
        match result {
            Ok(Progress::InProgress(_)) => {
                thread::sleep(Duration::from_millis(1));
                result = client.resume_connect();
            }
            _ => break,
        }
    }
    assert!(matches!(result, Err(Error::TlsClientConfigMissing)));
    assert_eq!(client.look().error, Some(ErrorKind::Tls));
}

#[test]
fn tls_through_connect_tunnel() {
    init_tracing();
    let (options, _guard) = generate_test_tls_options();

    let (mut listener, server_addr) = tls_listener(options.clone());
    let (proxy_addr, proxy) = spawn_proxy("200 Connection established", Some(server_addr));

    let client_options = Options {
        proxy: Some(proxy_addr.to_string()),
        ..options
    };
    let mut client = Connection::new(client_options, Protocol::Z3950);
    client.set_completion(len_prefixed);

    let target = format!("ssl:localhost:{}", server_addr.port());
    let mut child = establish(&mut client, &mut listener, &target);
    child.set_completion(len_prefixed);
    assert_eq!(client.peer_addr(), Some(proxy_addr));

    let head = proxy.join().unwrap();
    let authority = format!("localhost:{}", server_addr.port());
    assert!(head.starts_with(&format!("CONNECT {authority} HTTP/1.1\r\n")), "{head}");
    assert!(head.contains(&format!("Host: {authority}\r\n")), "{head}");

    let message = frame(b"tunnelled");
    assert_eq!(transfer(&mut client, &mut child, &message), message);
    assert_eq!(transfer(&mut child, &mut client, &message), message);
}

#[test]
fn refused_tunnel_is_reported() {
    init_tracing();
    let (options, _guard) = generate_test_tls_options();
    let (proxy_addr, proxy) = spawn_proxy("403 Forbidden", None);

    let client_options = Options {
        proxy: Some(proxy_addr.to_string()),
        ..options
    };
    let mut client = Connection::new(client_options, Protocol::Z3950);

    let mut result = client.connect("ssl:localhost:9999");
    for _ in 0..5000 {
        match result {
            Ok(Progress::InProgress(_)) => {
                thread::sleep(Duration::from_millis(1));
                result = client.resume_connect();
            }
            _ => break,
        }
    }
    match result {
        Err(Error::TunnelRefused(status)) => assert_eq!(status, "HTTP/1.1 403 Forbidden"),
        other => panic!("expected a refused tunnel, got {other:?}"),
    }
    assert_eq!(client.look().error, Some(ErrorKind::Tunnel));
    proxy.join().unwrap();
}
