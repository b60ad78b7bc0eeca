//! The byte-stream channel: arbitrary data between a local endpoint (UNIX
//! socket, spawned child, pty) and the remote peer. Payload is written to
//! the endpoint verbatim; reads are forwarded, optionally coalesced so
//! chatty interactive programs do not produce a frame per keystroke.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hatchway_common::{ChannelId, Problem};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{io_problem, ChannelEvent, ChannelEventTx, ChannelHandle, ChannelOp, OpenOptions};
use crate::pipe::{signal_name, Pipe, PipeEvent, StderrMode};

pub struct StreamChannel;

impl StreamChannel {
    pub fn open(
        id: ChannelId,
        options: OpenOptions,
        events_tx: ChannelEventTx,
        batch_delay: Duration,
        pressure: watch::Receiver<bool>,
    ) -> ChannelHandle {
        let (ops_tx, ops_rx) = unbounded_channel();
        tokio::spawn(run(id, options, ops_rx, events_tx, batch_delay, pressure));
        ChannelHandle { ops_tx }
    }
}

fn fail(id: ChannelId, events_tx: &ChannelEventTx, problem: Problem) {
    let _ = events_tx.send((id, ChannelEvent::closed(Some(problem))));
}

async fn open_pipe(
    id: ChannelId,
    options: &OpenOptions,
    events_tx: &ChannelEventTx,
) -> Option<(Pipe, bool)> {
    let unix = options.str("unix");
    let spawn = options.strv("spawn");

    match (unix, spawn) {
        (None, None) => {
            warn!(channel = id, "did not receive a unix or spawn option");
            fail(id, events_tx, Problem::ProtocolError);
            None
        }
        (Some(_), Some(_)) => {
            warn!(channel = id, "received both a unix and spawn option");
            fail(id, events_tx, Problem::ProtocolError);
            None
        }
        (Some(path), None) => match Pipe::connect_unix(path).await {
            Ok(pipe) => Some((pipe, false)),
            Err(error) => {
                warn!(channel = id, path, %error, "couldn't connect");
                fail(id, events_tx, io_problem(&error));
                None
            }
        },
        (None, Some(argv)) => {
            let environ = options.strv("environ").unwrap_or_default();
            let directory = options.str("directory");
            let result = if options.bool("pty", false) {
                Pipe::spawn_pty(&argv, &environ, directory)
            } else {
                let stderr_mode = match options.str("error") {
                    Some("output") => StderrMode::Merge,
                    _ => StderrMode::Log,
                };
                Pipe::spawn(&argv, &environ, directory, stderr_mode)
            };
            match result {
                Ok(pipe) => Some((pipe, true)),
                Err(error) => {
                    warn!(channel = id, program = %argv[0], %error, "couldn't run");
                    fail(id, events_tx, io_problem(&error));
                    None
                }
            }
        }
    }
}

async fn run(
    id: ChannelId,
    options: OpenOptions,
    mut ops_rx: UnboundedReceiver<ChannelOp>,
    events_tx: ChannelEventTx,
    batch_delay: Duration,
    mut pressure: watch::Receiver<bool>,
) {
    let Some((mut pipe, is_child)) = open_pipe(id, &options, &events_tx).await else {
        return;
    };
    let batch = options.int("batch").unwrap_or(0).max(0) as usize;

    let _ = events_tx.send((id, ChannelEvent::Ready));

    let mut buffer = BytesMut::new();
    let mut open = true;
    let mut closing = false;
    let mut timer_armed = false;
    let mut pressure_alive = true;
    let batch_timer = tokio::time::sleep(Duration::from_secs(86400));
    tokio::pin!(batch_timer);

    let flush = |buffer: &mut BytesMut| {
        if !buffer.is_empty() {
            let _ = events_tx.send((id, ChannelEvent::Data(buffer.split().freeze())));
        }
    };

    loop {
        tokio::select! {
            op = ops_rx.recv() => match op {
                Some(ChannelOp::Recv(data)) => pipe.write(data),
                Some(ChannelOp::Done) => pipe.shutdown_write(),
                Some(ChannelOp::Close(problem)) => {
                    closing = true;
                    timer_armed = false;
                    flush(&mut buffer);
                    if open {
                        pipe.close(problem);
                        // The close event comes back from the pipe, with
                        // exit details attached.
                    } else {
                        let _ = events_tx.send((id, ChannelEvent::closed(problem)));
                        return;
                    }
                }
                None => {
                    // The router is gone; tear down without ceremony.
                    pipe.close(Some(Problem::Terminated));
                    return;
                }
            },
            event = pipe.next_event() => match event {
                Some(PipeEvent::Data(data)) => {
                    buffer.extend_from_slice(&data);
                    if batch > 0 && buffer.len() < batch {
                        if !timer_armed {
                            batch_timer.as_mut().reset(Instant::now() + batch_delay);
                            timer_armed = true;
                        }
                    } else {
                        timer_armed = false;
                        flush(&mut buffer);
                    }
                }
                Some(PipeEvent::Eof) => {
                    timer_armed = false;
                    flush(&mut buffer);
                    if open && !closing {
                        debug!(channel = id, "end of data, closing pipe");
                        // Half-close towards the peer before the close
                        // itself.
                        let _ = events_tx.send((id, ChannelEvent::Done));
                        pipe.close(None);
                    }
                }
                Some(PipeEvent::Closed { problem, exit }) => {
                    open = false;
                    flush(&mut buffer);

                    let mut extras = Map::new();
                    if is_child {
                        if let Some(exit) = exit {
                            if let Some(code) = exit.code {
                                extras.insert("exit-status".into(), Value::from(code));
                            } else if let Some(signal) = exit.signal {
                                extras.insert(
                                    "exit-signal".into(),
                                    Value::from(signal_name(signal)),
                                );
                            }
                        }
                    }
                    let _ = events_tx.send((id, ChannelEvent::Closed { problem, extras }));
                    return;
                }
                None => {
                    fail(id, &events_tx, Problem::InternalError);
                    return;
                }
            },
            _ = &mut batch_timer, if timer_armed => {
                timer_armed = false;
                flush(&mut buffer);
            }
            changed = pressure.changed(), if pressure_alive => match changed {
                Ok(()) => pipe.set_pressure(*pressure.borrow_and_update()),
                Err(_) => pressure_alive = false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::UnboundedReceiver;

    type Events = UnboundedReceiver<(ChannelId, ChannelEvent)>;

    fn open(options: Value, batch_delay: Duration) -> (ChannelHandle, Events) {
        let (events_tx, events_rx) = unbounded_channel();
        let (_, pressure) = watch::channel(false);
        let handle = StreamChannel::open(
            9,
            OpenOptions::from_value(options),
            events_tx,
            batch_delay,
            pressure,
        );
        (handle, events_rx)
    }

    async fn next(events: &mut Events) -> ChannelEvent {
        let (id, event) = events.recv().await.expect("events ended");
        assert_eq!(id, 9);
        event
    }

    #[tokio::test]
    async fn test_spawn_with_exit_status() {
        let (_handle, mut events) = open(
            json!({"spawn": ["/bin/sh", "-c", "echo hi; exit 7"]}),
            Duration::from_millis(75),
        );

        assert!(matches!(next(&mut events).await, ChannelEvent::Ready));
        match next(&mut events).await {
            ChannelEvent::Data(data) => assert_eq!(&data[..], b"hi\n"),
            other => panic!("expected payload, got {other:?}"),
        }
        assert!(matches!(next(&mut events).await, ChannelEvent::Done));
        match next(&mut events).await {
            ChannelEvent::Closed { problem, extras } => {
                assert_eq!(problem, None);
                assert_eq!(extras.get("exit-status"), Some(&json!(7)));
                assert_eq!(extras.get("exit-signal"), None);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_with_exit_signal() {
        let (_handle, mut events) = open(
            json!({"spawn": ["/bin/sh", "-c", "kill -KILL $$"]}),
            Duration::from_millis(75),
        );

        assert!(matches!(next(&mut events).await, ChannelEvent::Ready));
        assert!(matches!(next(&mut events).await, ChannelEvent::Done));
        match next(&mut events).await {
            ChannelEvent::Closed { extras, .. } => {
                assert_eq!(extras.get("exit-signal"), Some(&json!("KILL")));
                assert_eq!(extras.get("exit-status"), None);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requires_exactly_one_endpoint() {
        let (_handle, mut events) = open(json!({}), Duration::from_millis(75));
        match next(&mut events).await {
            ChannelEvent::Closed { problem, .. } => {
                assert_eq!(problem, Some(Problem::ProtocolError))
            }
            other => panic!("expected close, got {other:?}"),
        }

        let (_handle, mut events) = open(
            json!({"unix": "/nowhere", "spawn": ["true"]}),
            Duration::from_millis(75),
        );
        match next(&mut events).await {
            ChannelEvent::Closed { problem, .. } => {
                assert_eq!(problem, Some(Problem::ProtocolError))
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unix_roundtrip() {
        let path = std::env::temp_dir().join(format!("hatchway-stream-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let (mut r, mut w) = conn.split();
            r.read_to_end(&mut buf).await.unwrap();
            w.write_all(&buf).await.unwrap();
        });

        let (handle, mut events) = open(
            json!({"unix": path.to_str().unwrap()}),
            Duration::from_millis(75),
        );
        assert!(matches!(next(&mut events).await, ChannelEvent::Ready));

        handle.recv(Bytes::from_static(b"ahoy"));
        handle.done();

        match next(&mut events).await {
            ChannelEvent::Data(data) => assert_eq!(&data[..], b"ahoy"),
            other => panic!("expected payload, got {other:?}"),
        }
        assert!(matches!(next(&mut events).await, ChannelEvent::Done));
        match next(&mut events).await {
            ChannelEvent::Closed { problem, extras } => {
                assert_eq!(problem, None);
                assert!(extras.is_empty());
            }
            other => panic!("expected close, got {other:?}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_batching_coalesces_small_reads() {
        let (_handle, mut events) = open(
            json!({
                "spawn": ["/bin/sh", "-c", "printf a; sleep 0.01; printf b; sleep 0.3"],
                "batch": 100,
            }),
            Duration::from_millis(75),
        );

        assert!(matches!(next(&mut events).await, ChannelEvent::Ready));
        match next(&mut events).await {
            ChannelEvent::Data(data) => assert_eq!(&data[..], b"ab"),
            other => panic!("expected coalesced payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_unix_socket_reports_not_found() {
        let (_handle, mut events) = open(
            json!({"unix": "/definitely/not/here.sock"}),
            Duration::from_millis(75),
        );
        match next(&mut events).await {
            ChannelEvent::Closed { problem, .. } => {
                assert_eq!(problem, Some(Problem::NotFound))
            }
            other => panic!("expected close, got {other:?}"),
        }
    }
}
