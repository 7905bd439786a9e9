use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tcpsst::{Driver, Reliability, SessionState, SstListener, SstStream, StreamCallbacks};

use crate::cmd::ListenArgs;
use crate::exit::{sst_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let driver = Driver::shared();
    let listener =
        SstListener::bind(&driver, args.addr.as_str()).map_err(|e| sst_error("bind failed", e))?;
    eprintln!("listening on {}", listener.local_addr());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let (tx, rx) = mpsc::channel::<(u64, Vec<u8>)>();
        let echo = args.echo;
        let session = listener
            .accept(Box::new(move |stream: SstStream| {
                let tx = tx.clone();
                let id = stream.id().value();
                let echo_handle = echo.then(|| stream.clone());
                Some(StreamCallbacks::on_bytes(move |payload| {
                    if let Some(handle) = &echo_handle {
                        let _ = handle.send(payload, Reliability::ReliableOrdered);
                    }
                    let _ = tx.send((id, payload.to_vec()));
                }))
            }))
            .map_err(|e| sst_error("accept failed", e))?;

        loop {
            if !running.load(Ordering::SeqCst) {
                session.shutdown();
                return Ok(SUCCESS);
            }
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok((stream, payload)) => {
                    print_frame(stream, &payload, format);
                    printed = printed.saturating_add(1);
                    if let Some(count) = args.count {
                        if printed >= count {
                            session.shutdown();
                            return Ok(SUCCESS);
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if session.state() == SessionState::Disconnected {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
