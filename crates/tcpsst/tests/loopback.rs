//! End-to-end tests over loopback TCP: two real peers, real sub-connection
//! pools, callback delivery on I/O threads.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tcpsst::{
    connect, connect_with_config, ConnectionStatus, Driver, Reliability, SessionConfig,
    SessionState, SstListener, SstSession, SstStream, StreamCallbacks,
};

const WAIT: Duration = Duration::from_secs(5);

fn config(width: u8) -> SessionConfig {
    SessionConfig {
        width,
        ..SessionConfig::default()
    }
}

/// Accept one session; every peer-opened stream feeds `(id, payload)`
/// into the returned channel.
fn accept_collector(
    listener: SstListener,
) -> (
    thread::JoinHandle<Arc<SstSession>>,
    mpsc::Receiver<(u64, Vec<u8>)>,
) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        listener
            .accept(Box::new(move |stream: SstStream| {
                let tx = tx.clone();
                let id = stream.id().value();
                Some(StreamCallbacks::on_bytes(move |payload| {
                    let _ = tx.send((id, payload.to_vec()));
                }))
            }))
            .expect("accept should produce a session")
    });
    (handle, rx)
}

fn no_substreams() -> tcpsst::SubstreamCallback {
    Box::new(|_stream| None)
}

#[test]
fn hello_roundtrip_over_width_three() {
    let driver = Driver::new("t-hello");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, rx) = accept_collector(listener);

    let stream = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    assert!(stream.session().wait_connected(WAIT));
    assert_eq!(stream.id().value(), 1);

    stream.send(b"hello", Reliability::ReliableOrdered).unwrap();

    let (sid, payload) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(sid, 1);
    assert_eq!(payload, b"hello");

    let server_session = server.join().unwrap();
    assert_eq!(server_session.width(), 3);
    assert_eq!(server_session.state(), SessionState::Connected);

    stream.session().shutdown();
}

#[test]
fn width_negotiation_signals_connected_once() {
    for width in [1u8, 2, 8, 16] {
        let driver = Driver::new("t-width");
        let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        let (server, _rx) = accept_collector(listener);

        let connected_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected_events);
        let callbacks = StreamCallbacks::default().with_connection(move |status, _| {
            if status == ConnectionStatus::Connected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let stream =
            connect_with_config(&driver, addr, config(width), no_substreams(), callbacks).unwrap();
        assert!(stream.session().wait_connected(WAIT), "width {width}");
        assert_eq!(stream.session().width(), width);

        let server_session = server.join().unwrap();
        assert_eq!(server_session.width(), width);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(connected_events.load(Ordering::SeqCst), 1, "width {width}");

        stream.session().shutdown();
        server_session.shutdown();
    }
}

#[test]
fn per_stream_order_survives_interleaving() {
    const ROUNDS: usize = 200;

    let driver = Driver::new("t-order");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, rx) = accept_collector(listener);

    let first = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    assert!(first.session().wait_connected(WAIT));
    let second = SstStream::clone_from(&first, StreamCallbacks::default()).unwrap();
    let third = SstStream::clone_from(&first, StreamCallbacks::default()).unwrap();
    let streams = [first, second, third];

    for seq in 0..ROUNDS {
        for stream in &streams {
            stream
                .send(&[seq as u8], Reliability::ReliableOrdered)
                .unwrap();
        }
    }

    let mut per_stream: HashMap<u64, Vec<u8>> = HashMap::new();
    for _ in 0..ROUNDS * streams.len() {
        let (sid, payload) = rx.recv_timeout(WAIT).expect("all frames should arrive");
        per_stream.entry(sid).or_default().push(payload[0]);
    }

    assert_eq!(per_stream.len(), 3);
    let expected: Vec<u8> = (0..ROUNDS).map(|seq| seq as u8).collect();
    for (sid, sequence) in per_stream {
        assert_eq!(sequence, expected, "stream {sid} out of order");
    }

    streams[0].session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn both_sides_open_streams_without_collision() {
    let driver = Driver::new("t-bidi");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();

    let (server_rx_tx, server_rx) = mpsc::channel::<(u64, Vec<u8>)>();
    let server = thread::spawn(move || {
        let session = listener
            .accept(Box::new(move |stream: SstStream| {
                let tx = server_rx_tx.clone();
                let id = stream.id().value();
                Some(StreamCallbacks::on_bytes(move |payload| {
                    let _ = tx.send((id, payload.to_vec()));
                }))
            }))
            .unwrap();
        let outbound = session.open_stream(StreamCallbacks::default()).unwrap();
        outbound
            .send(b"from-server", Reliability::ReliableOrdered)
            .unwrap();
        (session, outbound)
    });

    let (client_rx_tx, client_rx) = mpsc::channel::<(u64, Vec<u8>)>();
    let first = connect(
        &driver,
        addr,
        Box::new(move |stream: SstStream| {
            let tx = client_rx_tx.clone();
            let id = stream.id().value();
            Some(StreamCallbacks::on_bytes(move |payload| {
                let _ = tx.send((id, payload.to_vec()));
            }))
        }),
        StreamCallbacks::default(),
    )
    .unwrap();
    assert!(first.session().wait_connected(WAIT));

    let sibling = SstStream::clone_from(&first, StreamCallbacks::default()).unwrap();
    assert_eq!(first.id().value(), 1);
    assert_eq!(sibling.id().value(), 3);

    first
        .send(b"from-client", Reliability::ReliableOrdered)
        .unwrap();

    let (server_opened_sid, payload) = client_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(server_opened_sid % 2, 0, "acceptor ids must be even");
    assert_eq!(payload, b"from-server");

    let (client_sid, payload) = server_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(client_sid, 1);
    assert_eq!(payload, b"from-client");

    let (server_session, server_stream) = server.join().unwrap();
    assert_eq!(server_stream.id().value() % 2, 0);
    first.session().shutdown();
    server_session.shutdown();
}

#[test]
fn local_close_disconnects_once_and_silences_peer_sends() {
    let driver = Driver::new("t-close");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();

    // Server: on the peer's stream, start a background sender that keeps
    // transmitting long after the client closes.
    let server = thread::spawn(move || {
        listener
            .accept(Box::new(|stream: SstStream| {
                let sender = stream.clone();
                thread::spawn(move || {
                    for _ in 0..300 {
                        let _ = sender.send(b"tick", Reliability::ReliableOrdered);
                        thread::sleep(Duration::from_millis(2));
                    }
                });
                Some(StreamCallbacks::default())
            }))
            .unwrap()
    });

    let received = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let received = Arc::clone(&received);
        let disconnects = Arc::clone(&disconnects);
        StreamCallbacks::on_bytes(move |_| {
            received.fetch_add(1, Ordering::SeqCst);
        })
        .with_connection(move |status, _| {
            if status == ConnectionStatus::Disconnected {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let stream = connect(&driver, addr, no_substreams(), callbacks).unwrap();
    assert!(stream.session().wait_connected(WAIT));

    // Let a few ticks through, then close mid-flow.
    let deadline = Instant::now() + WAIT;
    while received.load(Ordering::SeqCst) < 5 {
        assert!(Instant::now() < deadline, "no ticks arrived");
        thread::sleep(Duration::from_millis(5));
    }
    stream.close();

    thread::sleep(Duration::from_millis(100));
    let after_close = received.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        received.load(Ordering::SeqCst),
        after_close,
        "delivery must stop at close"
    );
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // A closed stream swallows further local sends without error.
    stream.send(b"late", Reliability::ReliableOrdered).unwrap();

    stream.session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn shutdown_disconnects_every_stream_exactly_once() {
    let driver = Driver::new("t-shutdown");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, _rx) = accept_collector(listener);

    let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let disconnect_counter = |counter: &Arc<AtomicUsize>| {
        let counter = Arc::clone(counter);
        StreamCallbacks::default().with_connection(move |status, _| {
            if status == ConnectionStatus::Disconnected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let first = connect(
        &driver,
        addr,
        no_substreams(),
        disconnect_counter(&counters[0]),
    )
    .unwrap();
    assert!(first.session().wait_connected(WAIT));
    let _second = SstStream::clone_from(&first, disconnect_counter(&counters[1])).unwrap();
    let _third = SstStream::clone_from(&first, disconnect_counter(&counters[2])).unwrap();

    first.session().shutdown();
    assert_eq!(first.session().state(), SessionState::Disconnected);

    for (index, counter) in counters.iter().enumerate() {
        assert_eq!(
            counter.load(Ordering::SeqCst),
            1,
            "stream {index} disconnect count"
        );
    }

    // Sends on torn-down streams are swallowed; opening anew fails loudly.
    first.send(b"late", Reliability::ReliableOrdered).unwrap();
    assert!(matches!(
        SstStream::clone_from(&first, StreamCallbacks::default()),
        Err(tcpsst::SstError::NotConnected)
    ));

    server.join().unwrap().shutdown();
}

#[test]
fn sends_before_connected_flush_in_order() {
    let driver = Driver::new("t-preconnect");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, rx) = accept_collector(listener);

    let stream = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    // No wait_connected: these race the handshake on purpose.
    for seq in 0..50u8 {
        stream.send(&[seq], Reliability::ReliableOrdered).unwrap();
    }

    let mut sequence = Vec::new();
    for _ in 0..50 {
        let (sid, payload) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(sid, 1);
        sequence.push(payload[0]);
    }
    let expected: Vec<u8> = (0..50).collect();
    assert_eq!(sequence, expected);

    stream.session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn unreliable_sends_drop_past_high_water_mark() {
    let driver = Driver::new("t-hwm");
    let mut listener_config = config(1);
    listener_config.high_water_mark = 64 * 1024;
    let listener = SstListener::bind_with_config(&driver, "127.0.0.1:0", listener_config.clone())
        .unwrap();
    let addr = listener.local_addr();

    // Slow consumer: stall per frame so the sender's queue backs up.
    let (tx, rx) = mpsc::channel::<u8>();
    let server = thread::spawn(move || {
        listener
            .accept(Box::new(move |_stream: SstStream| {
                let tx = tx.clone();
                Some(StreamCallbacks::on_bytes(move |payload| {
                    thread::sleep(Duration::from_millis(10));
                    let _ = tx.send(payload[0]);
                }))
            }))
            .unwrap()
    });

    let stream = connect_with_config(
        &driver,
        addr,
        listener_config,
        no_substreams(),
        StreamCallbacks::default(),
    )
    .unwrap();
    assert!(stream.session().wait_connected(WAIT));

    // Enqueue far more than the writer can push out immediately.
    let bulk = vec![0u8; 512 * 1024];
    for _ in 0..24 {
        stream.send(&bulk, Reliability::ReliableUnordered).unwrap();
    }
    // The queue is deep past the mark now: this one must vanish.
    stream.send(&[1], Reliability::Unreliable).unwrap();
    // Reliable end marker still goes through.
    stream.send(&[2], Reliability::ReliableUnordered).unwrap();

    let mut bulk_frames = 0usize;
    let mut saw_dropped_marker = false;
    loop {
        let first_byte = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("stream should drain to the end marker");
        match first_byte {
            0 => bulk_frames += 1,
            1 => saw_dropped_marker = true,
            2 => break,
            other => panic!("unexpected payload marker {other}"),
        }
    }

    assert_eq!(bulk_frames, 24, "reliable frames must all arrive");
    assert!(!saw_dropped_marker, "unreliable frame should have been shed");

    stream.session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn late_stream_gets_synthetic_connected_event() {
    let driver = Driver::new("t-late");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, _rx) = accept_collector(listener);

    let first = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    assert!(first.session().wait_connected(WAIT));

    let (tx, rx) = mpsc::channel();
    let callbacks = StreamCallbacks::default().with_connection(move |status, _| {
        let _ = tx.send(status);
    });
    let _late = SstStream::clone_from(&first, callbacks).unwrap();

    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        ConnectionStatus::Connected,
        "late registrant should see a synthetic connected event"
    );

    first.session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn refused_substreams_drop_frames_silently() {
    let driver = Driver::new("t-refuse");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();

    let refused = Arc::new(AtomicUsize::new(0));
    let server = {
        let refused = Arc::clone(&refused);
        thread::spawn(move || {
            listener
                .accept(Box::new(move |_stream: SstStream| {
                    refused.fetch_add(1, Ordering::SeqCst);
                    None
                }))
                .unwrap()
        })
    };

    let stream = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    assert!(stream.session().wait_connected(WAIT));
    stream
        .send(b"into the void", Reliability::ReliableOrdered)
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    // Sender is none the wiser; the session stays healthy.
    assert_eq!(stream.session().state(), SessionState::Connected);

    stream.session().shutdown();
    server.join().unwrap().shutdown();
}

#[test]
fn connect_failure_reports_connect_failed() {
    // Bind then drop, leaving a port with nothing behind it.
    let dead_addr = {
        let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        placeholder.local_addr().unwrap()
    };

    let driver = Driver::new("t-refused");
    let (tx, rx) = mpsc::channel();
    let callbacks = StreamCallbacks::default().with_connection(move |status, _| {
        let _ = tx.send(status);
    });

    let stream = connect(&driver, dead_addr, no_substreams(), callbacks).unwrap();
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        ConnectionStatus::ConnectFailed
    );
    assert!(!stream.session().wait_connected(Duration::from_millis(200)));
    assert_eq!(stream.session().state(), SessionState::Disconnected);
}

#[test]
fn garbage_after_handshake_tears_the_session_down() {
    let driver = Driver::new("t-garbage");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, _rx) = accept_collector(listener);

    // A hand-rolled width-1 initiator that turns hostile after the
    // handshake.
    let mut raw = std::net::TcpStream::connect(addr).unwrap();
    let mut hello = Vec::new();
    hello.extend_from_slice(b"SST");
    hello.push(1); // version
    hello.push(1); // width
    hello.extend_from_slice(&0x1122_3344_5566_0001u64.to_le_bytes());
    raw.write_all(&hello).unwrap();
    let mut confirm = [0u8; 5];
    raw.read_exact(&mut confirm).unwrap();
    assert_eq!(&confirm[..3], b"SST");

    let session = server.join().unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    // Five continuation bytes: a length prefix that never terminates.
    raw.write_all(&[0xff; 5]).unwrap();

    let deadline = Instant::now() + WAIT;
    while session.state() != SessionState::Disconnected {
        assert!(
            Instant::now() < deadline,
            "protocol violation should tear the session down"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn bad_opening_is_skipped_and_next_session_accepted() {
    let driver = Driver::new("t-badopen");
    let listener = SstListener::bind(&driver, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();
    let (server, _rx) = accept_collector(listener);

    // Neither a hello nor a known join: dropped by the acceptor.
    {
        let mut raw = std::net::TcpStream::connect(addr).unwrap();
        raw.write_all(b"garbage-bytes").unwrap();
    }

    let stream = connect(&driver, addr, no_substreams(), StreamCallbacks::default()).unwrap();
    assert!(stream.session().wait_connected(WAIT));

    let session = server.join().unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    stream.session().shutdown();
    session.shutdown();
}
