use std::sync::mpsc;
use std::time::Duration;

use tcpsst::{connect_with_config, Driver, SessionConfig, StreamCallbacks};

use crate::cmd::SendArgs;
use crate::exit::{sst_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = match (&args.data, &args.file) {
        (Some(data), None) => data.clone().into_bytes(),
        (None, Some(path)) => std::fs::read(path)
            .map_err(|err| CliError::new(USAGE, format!("cannot read {}: {err}", path.display())))?,
        (None, None) => Vec::new(),
        (Some(_), Some(_)) => unreachable!("clap conflicts_with prevents this"),
    };

    let timeout = Duration::from_secs(args.timeout);
    let config = SessionConfig {
        width: args.width,
        ..SessionConfig::default()
    };

    let driver = Driver::shared();
    let (reply_tx, reply_rx) = mpsc::channel::<(u64, Vec<u8>)>();
    let mut stream_callbacks = StreamCallbacks::default().with_connection(|status, reason| {
        tracing::debug!(?status, reason, "session event");
    });
    if args.wait {
        // Replies may come back on the stream we opened; the initiator's
        // first stream always has id 1.
        let tx = reply_tx.clone();
        stream_callbacks.bytes = Some(Box::new(move |payload: &[u8]| {
            let _ = tx.send((1, payload.to_vec()));
        }));
    }

    let stream = connect_with_config(
        &driver,
        args.addr.as_str(),
        config,
        Box::new(move |peer_stream| {
            let tx = reply_tx.clone();
            let id = peer_stream.id().value();
            Some(StreamCallbacks::on_bytes(move |payload| {
                let _ = tx.send((id, payload.to_vec()));
            }))
        }),
        stream_callbacks,
    )
    .map_err(|e| sst_error("connect failed", e))?;

    if !stream.session().wait_connected(timeout) {
        return Err(CliError::new(TIMEOUT, "connect timed out"));
    }

    stream
        .send(&payload, args.reliability.into())
        .map_err(|e| sst_error("send failed", e))?;
    tracing::info!(bytes = payload.len(), stream = %stream.id(), "payload sent");

    if args.wait {
        match reply_rx.recv_timeout(timeout) {
            Ok((sid, reply)) => print_frame(sid, &reply, format),
            Err(_) => return Err(CliError::new(TIMEOUT, "timed out waiting for response")),
        }
    }

    stream.close();
    stream.session().shutdown();
    Ok(SUCCESS)
}
