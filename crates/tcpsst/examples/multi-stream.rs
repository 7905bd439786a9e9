//! Multi-stream demo: three logical streams over one width-3 session.
//!
//! Run with:
//!   cargo run --example multi-stream

use std::sync::mpsc;
use std::time::Duration;

use tcpsst::{connect, Driver, Reliability, SstListener, SstStream, StreamCallbacks};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let driver = Driver::new("demo");
    let listener = SstListener::bind(&driver, "127.0.0.1:0")?;
    let addr = listener.local_addr();

    // Acceptor: echo every payload back on the stream it arrived on.
    let server = std::thread::spawn(move || -> tcpsst::Result<()> {
        let session = listener.accept(Box::new(|stream: SstStream| {
            eprintln!("[server] peer opened stream {}", stream.id());
            let echo = stream.clone();
            Some(StreamCallbacks::on_bytes(move |payload| {
                let _ = echo.send(payload, Reliability::ReliableOrdered);
            }))
        }))?;
        while session.state() == tcpsst::SessionState::Connected {
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    });

    let (echo_tx, echo_rx) = mpsc::channel::<String>();

    let collector = |tx: mpsc::Sender<String>| {
        StreamCallbacks::on_bytes(move |payload| {
            let _ = tx.send(String::from_utf8_lossy(payload).into_owned());
        })
    };

    let first = connect(
        &driver,
        addr,
        Box::new(|_stream| None),
        collector(echo_tx.clone()),
    )?;
    assert!(first.session().wait_connected(Duration::from_secs(5)));

    let mut streams = vec![first];
    for _ in 0..2 {
        let sibling = SstStream::clone_from(&streams[0], collector(echo_tx.clone()))?;
        streams.push(sibling);
    }

    for stream in &streams {
        let message = format!("hello from stream {}", stream.id());
        stream.send(message.as_bytes(), Reliability::ReliableOrdered)?;
    }

    for _ in 0..streams.len() {
        let echoed = echo_rx.recv_timeout(Duration::from_secs(5))?;
        eprintln!("[client] echoed back: {echoed}");
    }

    for stream in &streams {
        stream.close();
    }
    streams[0].session().shutdown();

    server.join().expect("server thread should not panic")?;
    Ok(())
}
