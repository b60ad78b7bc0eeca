//! Frames over the stdio of a locally spawned bridge process.

use bytes::Bytes;
use hatchway_common::Problem;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, warn};

use crate::frame::{encode_frame, encode_message, parse_commands, parse_frame, MessageDecoder};
use crate::pipe::{Pipe, PipeEvent, StderrMode};
use crate::transport::{
    closed_event, TransportCommand, TransportEvent, TransportEventTx, TransportHandle, TransportRef,
};

pub struct LocalTransport;

impl LocalTransport {
    /// Spawn the bridge program with its stdio bound to this transport.
    pub fn spawn(
        sref: TransportRef,
        program: &[String],
        events_tx: TransportEventTx,
    ) -> std::io::Result<TransportHandle> {
        let mut pipe = Pipe::spawn(program, &[], None, StderrMode::Log)?;
        let (tx, mut rx) = unbounded_channel();

        tokio::spawn(async move {
            let mut decoder = MessageDecoder::new();
            let mut failing = false;
            let mut commands_done = false;

            loop {
                tokio::select! {
                    command = rx.recv(), if !commands_done => match command {
                        Some(TransportCommand::Send(channel, payload)) => {
                            pipe.write(encode_message(&encode_frame(channel, &payload)));
                        }
                        Some(TransportCommand::SetPressure(on)) => {
                            pipe.set_pressure(on);
                        }
                        Some(TransportCommand::Close(problem)) => {
                            commands_done = true;
                            pipe.close(problem);
                        }
                        None => {
                            commands_done = true;
                            pipe.close(None);
                        }
                    },
                    event = pipe.next_event() => match event {
                        Some(PipeEvent::Data(data)) => {
                            if failing {
                                continue;
                            }
                            decoder.extend(&data);
                            if !dispatch_messages(sref, &mut decoder, &events_tx) {
                                failing = true;
                                pipe.close(Some(Problem::ProtocolError));
                            }
                        }
                        Some(PipeEvent::Eof) => {
                            debug!(transport = sref, "bridge closed its output");
                            pipe.close(None);
                        }
                        Some(PipeEvent::Closed { problem, exit }) => {
                            // A clean child exit is a clean transport
                            // close; anything else is a problem.
                            let problem = problem.or_else(|| match exit {
                                Some(exit) if exit.signal.is_some() => Some(Problem::Terminated),
                                Some(exit) if exit.code != Some(0) => Some(Problem::InternalError),
                                _ => None,
                            });
                            let _ = events_tx.send((sref, closed_event(problem)));
                            return;
                        }
                        None => {
                            let _ = events_tx.send((sref, closed_event(Some(Problem::InternalError))));
                            return;
                        }
                    },
                }
            }
        });

        Ok(TransportHandle::new(tx))
    }
}

/// Decode and dispatch every complete message buffered so far. Returns
/// false when the bridge violated the protocol.
pub(crate) fn dispatch_messages(
    sref: TransportRef,
    decoder: &mut MessageDecoder,
    events_tx: &TransportEventTx,
) -> bool {
    loop {
        let message = match decoder.next_message() {
            Ok(Some(message)) => message,
            Ok(None) => return true,
            Err(error) => {
                warn!(transport = sref, %error, "received invalid framing from bridge");
                return false;
            }
        };
        if !dispatch_frame(sref, &message, events_tx) {
            return false;
        }
    }
}

pub(crate) fn dispatch_frame(
    sref: TransportRef,
    message: &[u8],
    events_tx: &TransportEventTx,
) -> bool {
    let (channel, payload) = match parse_frame(message) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(transport = sref, %error, "received invalid message from bridge");
            return false;
        }
    };

    if channel == 0 {
        let commands = match parse_commands(payload) {
            Ok(commands) => commands,
            Err(error) => {
                warn!(transport = sref, %error, "received unparseable control message from bridge");
                return false;
            }
        };
        for command in commands {
            let _ = events_tx.send((sref, TransportEvent::Control(command)));
        }
    } else {
        let _ = events_tx.send((
            sref,
            TransportEvent::Recv(channel, Bytes::copy_from_slice(payload)),
        ));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_local_transport_roundtrip() {
        // `cat` echoes our framed messages straight back.
        let (events_tx, mut events_rx) = unbounded_channel();
        let handle =
            LocalTransport::spawn(1, &["/bin/cat".to_string()], events_tx).unwrap();

        handle.send(5, Bytes::from_static(b"marmalade"));
        let (sref, event) = events_rx.recv().await.unwrap();
        assert_eq!(sref, 1);
        match event {
            TransportEvent::Recv(channel, payload) => {
                assert_eq!(channel, 5);
                assert_eq!(&payload[..], b"marmalade");
            }
            other => panic!("expected payload frame, got {other:?}"),
        }

        handle.send(0, Bytes::from_static(br#"{"command":"ping"}"#));
        let (_, event) = events_rx.recv().await.unwrap();
        match event {
            TransportEvent::Control(command) => assert_eq!(command.command, "ping"),
            other => panic!("expected control frame, got {other:?}"),
        }

        handle.close(None);
        let (_, event) = events_rx.recv().await.unwrap();
        match event {
            TransportEvent::Closed { problem, .. } => assert_eq!(problem, None),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_transport_bad_framing_is_a_protocol_error() {
        // A bridge that writes garbage instead of framed messages.
        let (events_tx, mut events_rx) = unbounded_channel();
        let handle = LocalTransport::spawn(
            1,
            &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo garbage; sleep 5".to_string(),
            ],
            events_tx,
        )
        .unwrap();

        let (_, event) = events_rx.recv().await.unwrap();
        match event {
            TransportEvent::Closed { problem, .. } => {
                assert_eq!(problem, Some(Problem::ProtocolError));
            }
            other => panic!("expected protocol-error close, got {other:?}"),
        }
        drop(handle);
    }

    #[tokio::test]
    async fn test_local_transport_nonzero_exit() {
        let (events_tx, mut events_rx) = unbounded_channel();
        let _handle = LocalTransport::spawn(
            1,
            &["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            events_tx,
        )
        .unwrap();

        let (_, event) = events_rx.recv().await.unwrap();
        match event {
            TransportEvent::Closed { problem, .. } => {
                assert_eq!(problem, Some(Problem::InternalError));
            }
            other => panic!("expected close, got {other:?}"),
        }
    }
}
