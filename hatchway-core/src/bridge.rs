//! The bridge half of the protocol: a helper process whose stdio carries
//! framed messages. It opens channels on behalf of the gateway, routes
//! payload to them and reports their events back as frames.

use std::collections::HashMap;

use bytes::Bytes;
use hatchway_common::{ChannelId, HatchwayConfig, Problem};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::channel::{
    ChannelEvent, ChannelEventTx, ChannelHandle, HttpChannel, HttpPool, OpenOptions, StreamChannel,
};
use crate::frame::{
    encode_frame, encode_message, parse_commands, parse_frame, ControlCommand, MessageDecoder,
};

/// When this many messages are queued for the gateway, channel pipes are
/// paused; reading resumes below the low mark.
const QUEUE_HIGH_WATER: usize = 128;
const QUEUE_LOW_WATER: usize = 16;

pub struct Bridge {
    config: HatchwayConfig,
    channels: HashMap<ChannelId, ChannelHandle>,
    pool: HttpPool,
    events_tx: ChannelEventTx,
    out_tx: UnboundedSender<Bytes>,
    pressure: watch::Receiver<bool>,
}

impl Bridge {
    /// Serve this process's stdio until the gateway hangs up.
    pub async fn run_stdio(config: HatchwayConfig) -> anyhow::Result<()> {
        let (in_tx, in_rx) = unbounded_channel();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 8192];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if in_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = unbounded_channel::<Bytes>();
        let (pressure_tx, pressure_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(message) = out_rx.recv().await {
                if stdout.write_all(&message).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;

                // A slow gateway backpressures every channel at once.
                let backlog = out_rx.len();
                let pressed = *pressure_tx.borrow();
                if !pressed && backlog > QUEUE_HIGH_WATER {
                    let _ = pressure_tx.send(true);
                } else if pressed && backlog < QUEUE_LOW_WATER {
                    let _ = pressure_tx.send(false);
                }
            }
        });

        Self::run(config, in_rx, out_tx, pressure_rx).await
    }

    /// The router loop, separated from stdio so tests can drive it with
    /// in-memory pipes.
    pub async fn run(
        config: HatchwayConfig,
        mut input: UnboundedReceiver<Bytes>,
        out_tx: UnboundedSender<Bytes>,
        pressure: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = unbounded_channel();
        let mut bridge = Bridge {
            config,
            channels: HashMap::new(),
            pool: HttpPool::new(),
            events_tx,
            out_tx,
            pressure,
        };
        let mut decoder = MessageDecoder::new();

        loop {
            tokio::select! {
                chunk = input.recv() => match chunk {
                    Some(data) => {
                        decoder.extend(&data);
                        loop {
                            match decoder.next_message() {
                                Ok(Some(frame)) => bridge.handle_frame(&frame),
                                Ok(None) => break,
                                Err(error) => {
                                    return Err(hatchway_common::HatchwayError::InvalidControl(
                                        format!("invalid framing from gateway: {error}"),
                                    )
                                    .into());
                                }
                            }
                        }
                    }
                    None => {
                        debug!("gateway hung up");
                        return Ok(());
                    }
                },
                Some((id, event)) = events_rx.recv() => {
                    bridge.handle_channel_event(id, event);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let (channel, payload) = match parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "received invalid frame");
                return;
            }
        };

        if channel == 0 {
            match parse_commands(payload) {
                Ok(commands) => {
                    for command in commands {
                        self.handle_control(command);
                    }
                }
                Err(error) => warn!(%error, "received unparseable control message"),
            }
            return;
        }

        match self.channels.get(&channel) {
            Some(handle) => handle.recv(Bytes::copy_from_slice(payload)),
            None => debug!(channel, "dropping payload for unknown channel"),
        }
    }

    fn handle_control(&mut self, command: ControlCommand) {
        match command.command.as_str() {
            "open" => self.process_open(&command),
            "close" => {
                if let Some(handle) = command.channel.and_then(|c| self.channels.get(&c)) {
                    let problem = command
                        .options
                        .get("problem")
                        .and_then(Value::as_str)
                        .and_then(|p| p.parse::<Problem>().ok());
                    handle.close(problem);
                }
            }
            "done" => {
                if let Some(handle) = command.channel.and_then(|c| self.channels.get(&c)) {
                    handle.done();
                }
            }
            "ping" => self.send_control(&json!({"command": "pong"})),
            "pong" => {}
            other => debug!(command = %other, "received unknown control command"),
        }
    }

    fn process_open(&mut self, command: &ControlCommand) {
        let Some(channel) = command.channel else {
            warn!("open command without a channel");
            return;
        };
        if self.channels.contains_key(&channel) {
            warn!(channel, "cannot open a channel with the same number as another channel");
            self.report_close(channel, Some(Problem::ProtocolError), &serde_json::Map::new());
            return;
        }

        let options = OpenOptions::from_command(command);
        let payload_type = command.options.get("payload").and_then(Value::as_str);
        let handle = match payload_type {
            Some("stream") => StreamChannel::open(
                channel,
                options,
                self.events_tx.clone(),
                self.config.store.stream_batch_delay,
                self.pressure.clone(),
            ),
            Some("http-stream1") => {
                HttpChannel::open(channel, options, self.events_tx.clone(), self.pool.clone())
            }
            other => {
                warn!(channel, ?other, "unsupported payload type");
                self.report_close(channel, Some(Problem::ProtocolError), &serde_json::Map::new());
                return;
            }
        };
        self.channels.insert(channel, handle);
    }

    fn handle_channel_event(&mut self, id: ChannelId, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready => {
                self.send_control(&json!({"command": "ready", "channel": id}));
            }
            ChannelEvent::Data(data) => self.send_frame(id, &data),
            ChannelEvent::Done => {
                self.send_control(&json!({"command": "done", "channel": id}));
            }
            ChannelEvent::Closed { problem, extras } => {
                self.channels.remove(&id);
                self.report_close(id, problem, &extras);
            }
        }
    }

    fn report_close(
        &self,
        channel: ChannelId,
        problem: Option<Problem>,
        extras: &serde_json::Map<String, Value>,
    ) {
        let mut close = serde_json::Map::new();
        close.insert("command".into(), Value::from("close"));
        close.insert("channel".into(), Value::from(channel));
        if let Some(problem) = problem {
            close.insert("problem".into(), Value::from(problem.as_str()));
        }
        for (key, value) in extras {
            close.insert(key.clone(), value.clone());
        }
        self.send_control(&Value::Object(close));
    }

    fn send_control(&self, value: &Value) {
        self.send_frame(0, value.to_string().as_bytes());
    }

    fn send_frame(&self, channel: ChannelId, payload: &[u8]) {
        let _ = self
            .out_tx
            .send(encode_message(&encode_frame(channel, payload)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Harness {
        in_tx: UnboundedSender<Bytes>,
        out_rx: UnboundedReceiver<Bytes>,
        decoder: MessageDecoder,
        _pressure_tx: watch::Sender<bool>,
    }

    fn start() -> Harness {
        let (in_tx, in_rx) = unbounded_channel();
        let (out_tx, out_rx) = unbounded_channel();
        let (pressure_tx, pressure_rx) = watch::channel(false);
        tokio::spawn(Bridge::run(
            HatchwayConfig::default(),
            in_rx,
            out_tx,
            pressure_rx,
        ));
        Harness {
            in_tx,
            out_rx,
            decoder: MessageDecoder::new(),
            _pressure_tx: pressure_tx,
        }
    }

    impl Harness {
        fn send(&self, frame: &[u8]) {
            let _ = self.in_tx.send(encode_message(frame));
        }

        fn send_control(&self, value: Value) {
            self.send(format!("0\n{value}").as_bytes());
        }

        async fn next_frame(&mut self) -> (ChannelId, Bytes) {
            loop {
                if let Some(message) = self.decoder.next_message().unwrap() {
                    let (channel, payload) = parse_frame(&message).unwrap();
                    return (channel, Bytes::copy_from_slice(payload));
                }
                let chunk = self.out_rx.recv().await.expect("bridge output ended");
                self.decoder.extend(&chunk);
            }
        }

        async fn next_control(&mut self) -> Value {
            let (channel, payload) = self.next_frame().await;
            assert_eq!(channel, 0);
            serde_json::from_slice(&payload).unwrap()
        }
    }

    #[tokio::test]
    async fn test_stream_channel_lifecycle() {
        let mut h = start();

        h.send_control(json!({
            "command": "open",
            "channel": 7,
            "payload": "stream",
            "spawn": ["/bin/sh", "-c", "echo hi; exit 7"],
        }));

        let ready = h.next_control().await;
        assert_eq!(ready, json!({"command": "ready", "channel": 7}));

        let (channel, payload) = h.next_frame().await;
        assert_eq!(channel, 7);
        assert_eq!(&payload[..], b"hi\n");

        let done = h.next_control().await;
        assert_eq!(done, json!({"command": "done", "channel": 7}));

        let close = h.next_control().await;
        assert_eq!(close["command"], json!("close"));
        assert_eq!(close["channel"], json!(7));
        assert_eq!(close["exit-status"], json!(7));
        assert!(close.get("problem").is_none());
    }

    #[tokio::test]
    async fn test_payload_and_done_are_routed() {
        let mut h = start();

        h.send_control(json!({
            "command": "open",
            "channel": 3,
            "payload": "stream",
            "spawn": ["/bin/cat"],
        }));
        let _ready = h.next_control().await;

        h.send(b"3\nround trip");
        h.send_control(json!({"command": "done", "channel": 3}));

        let (channel, payload) = h.next_frame().await;
        assert_eq!(channel, 3);
        assert_eq!(&payload[..], b"round trip");

        let done = h.next_control().await;
        assert_eq!(done, json!({"command": "done", "channel": 3}));

        let close = h.next_control().await;
        assert_eq!(close["channel"], json!(3));
        assert_eq!(close["exit-status"], json!(0));
    }

    #[tokio::test]
    async fn test_unknown_payload_type_is_rejected() {
        let mut h = start();

        h.send_control(json!({
            "command": "open",
            "channel": 2,
            "payload": "telepathy",
        }));

        let close = h.next_control().await;
        assert_eq!(close["command"], json!("close"));
        assert_eq!(close["channel"], json!(2));
        assert_eq!(close["problem"], json!("protocol-error"));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut h = start();
        h.send_control(json!({"command": "ping"}));
        let pong = h.next_control().await;
        assert_eq!(pong["command"], json!("pong"));
    }
}
