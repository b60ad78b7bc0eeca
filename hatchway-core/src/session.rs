//! The per-connection session manager. One browser WebSocket maps to one
//! `GatewayService`, which owns every session (and therefore every
//! transport and channel) opened through it, routes frames in both
//! directions and enforces channel ownership between untrusted peers
//! sharing the connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use hatchway_common::{ChannelId, Credentials, HatchwayConfig, Problem, Secret};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::authorize::process_authorize;
use crate::frame::{encode_frame, parse_commands, parse_frame, ControlCommand};
use crate::transport::{
    LocalTransport, SshTransport, SshTransportOptions, TransportEvent, TransportEventRx,
    TransportEventTx, TransportHandle, TransportRef,
};

/// What the WebSocket endpoint feeds into the service.
#[derive(Debug)]
pub enum BrowserInput {
    Frame(Bytes),
    /// The outbound socket buffer crossed a watermark; throttle (or
    /// release) every bridge feeding this browser.
    Pressure(bool),
    Closing,
}

/// Creates the actual transports. Tests substitute their own to drive
/// the session manager without processes or network.
pub trait TransportFactory: Send + Sync + 'static {
    fn local(
        &self,
        sref: TransportRef,
        events: TransportEventTx,
    ) -> std::io::Result<TransportHandle>;

    fn ssh(
        &self,
        sref: TransportRef,
        options: SshTransportOptions,
        creds: Arc<Credentials>,
        events: TransportEventTx,
    ) -> std::io::Result<TransportHandle>;
}

pub struct DefaultTransportFactory {
    pub config: HatchwayConfig,
}

impl TransportFactory for DefaultTransportFactory {
    fn local(
        &self,
        sref: TransportRef,
        events: TransportEventTx,
    ) -> std::io::Result<TransportHandle> {
        LocalTransport::spawn(sref, &self.config.store.bridge.program, events)
    }

    fn ssh(
        &self,
        sref: TransportRef,
        options: SshTransportOptions,
        creds: Arc<Credentials>,
        events: TransportEventTx,
    ) -> std::io::Result<TransportHandle> {
        Ok(SshTransport::connect(sref, options, creds, events))
    }
}

struct Session {
    key: (String, String),
    transport: TransportHandle,
    channels: Vec<ChannelId>,
    creds: Arc<Credentials>,
    /// No more frames go to this transport (browser is going away).
    sent_eof: bool,
    /// Bumped on every channel attach/detach; stale idle timers see a
    /// different generation and do nothing.
    idle_generation: u64,
}

pub struct GatewayService {
    config: HatchwayConfig,
    factory: Arc<dyn TransportFactory>,
    creds: Option<Arc<Credentials>>,
    browser_tx: UnboundedSender<Bytes>,

    sessions: HashMap<TransportRef, Session>,
    by_channel: HashMap<ChannelId, TransportRef>,
    by_host_user: HashMap<(String, String), TransportRef>,
    /// Channels the browser has closed (or we closed towards it); payload
    /// frames for these ids are dropped silently.
    closed_channels: HashSet<ChannelId>,

    events_tx: TransportEventTx,
    events_rx: Option<TransportEventRx>,
    timer_tx: UnboundedSender<(TransportRef, u64)>,
    timer_rx: Option<UnboundedReceiver<(TransportRef, u64)>>,

    closing: bool,
    next_ref: TransportRef,
}

impl GatewayService {
    /// Returns the service and the stream of frames for the browser.
    pub fn new(
        config: HatchwayConfig,
        creds: Option<Arc<Credentials>>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, UnboundedReceiver<Bytes>) {
        let (browser_tx, browser_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let (timer_tx, timer_rx) = unbounded_channel();
        (
            Self {
                config,
                factory,
                creds,
                browser_tx,
                sessions: HashMap::new(),
                by_channel: HashMap::new(),
                by_host_user: HashMap::new(),
                closed_channels: HashSet::new(),
                events_tx,
                events_rx: Some(events_rx),
                timer_tx,
                timer_rx: Some(timer_rx),
                closing: false,
                next_ref: 1,
            },
            browser_rx,
        )
    }

    pub async fn run(mut self, mut browser_rx: UnboundedReceiver<BrowserInput>) {
        if self.creds.is_none() {
            // Auth errors travel as regular frames: the browser cannot
            // see HTTP status codes on a WebSocket.
            info!("closing unauthenticated connection");
            self.report_close(0, Some(Problem::NoSession), &Map::new());
            return;
        }

        let (Some(mut events_rx), Some(mut timer_rx)) =
            (self.events_rx.take(), self.timer_rx.take())
        else {
            return;
        };

        let ping_interval = self.config.store.gateway.ping_interval;
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );
        let mut browser_gone = false;

        loop {
            tokio::select! {
                input = browser_rx.recv(), if !browser_gone => match input {
                    Some(BrowserInput::Frame(frame)) => self.handle_browser_frame(&frame),
                    Some(BrowserInput::Pressure(on)) => {
                        for session in self.sessions.values() {
                            session.transport.set_pressure(on);
                        }
                    }
                    Some(BrowserInput::Closing) | None => {
                        browser_gone = true;
                        self.begin_close();
                    }
                },
                Some((sref, event)) = events_rx.recv() => {
                    self.handle_transport_event(sref, event);
                }
                Some((sref, generation)) = timer_rx.recv() => {
                    self.handle_idle_timeout(sref, generation);
                }
                _ = ping.tick() => {
                    self.send_control(&json!({"command": "ping"}));
                }
            }

            if self.closing && self.sessions.is_empty() {
                return;
            }
        }
    }

    /* -----------------------------------------------------------------
     * Browser → gateway
     */

    fn handle_browser_frame(&mut self, frame: &[u8]) {
        let (channel, payload) = match parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "received invalid frame from browser");
                self.inbound_protocol_error();
                return;
            }
        };

        if channel == 0 {
            self.dispatch_inbound_commands(payload);
            return;
        }

        if self.closing {
            return;
        }

        if self.closed_channels.contains(&channel) {
            debug!(channel, "dropping payload for closed channel");
            return;
        }

        match self.by_channel.get(&channel) {
            Some(sref) => {
                if let Some(session) = self.sessions.get(sref) {
                    if !session.sent_eof {
                        session
                            .transport
                            .send(channel, Bytes::copy_from_slice(payload));
                    }
                }
            }
            None => {
                // The browser never opened this channel.
                warn!(channel, "received payload for a channel that was never opened");
                self.closed_channels.insert(channel);
                self.report_close(channel, Some(Problem::ProtocolError), &Map::new());
            }
        }
    }

    fn dispatch_inbound_commands(&mut self, payload: &[u8]) {
        let commands = match parse_commands(payload) {
            Ok(commands) => commands,
            Err(error) => {
                warn!(%error, "received unparseable control message from browser");
                self.inbound_protocol_error();
                return;
            }
        };
        for command in commands {
            self.dispatch_inbound_command(command);
        }
    }

    fn dispatch_inbound_command(&mut self, command: ControlCommand) {
        let mut forward = true;
        let valid = match command.command.as_str() {
            "open" => self.process_open(&command),
            "close" => {
                if let Some(channel) = command.channel {
                    self.closed_channels.insert(channel);
                }
                true
            }
            "ping" => {
                forward = false;
                self.send_control(&json!({"command": "pong"}));
                true
            }
            "pong" => {
                forward = false;
                true
            }
            _ => true,
        };

        if !valid {
            self.inbound_protocol_error();
            return;
        }
        if !forward {
            return;
        }

        match command.channel {
            None => {
                // Control messages without a channel go to every bridge,
                // so all of them see e.g. a logout.
                for session in self.sessions.values() {
                    if !session.sent_eof {
                        session.transport.send(0, command.to_bytes());
                    }
                }
            }
            Some(channel) => match self.by_channel.get(&channel) {
                Some(sref) => {
                    if let Some(session) = self.sessions.get(sref) {
                        if !session.sent_eof {
                            session.transport.send(0, command.to_bytes());
                        }
                    }
                }
                None => {
                    debug!(channel, command = %command.command,
                           "dropping control message for unknown channel");
                }
            },
        }
    }

    fn process_open(&mut self, command: &ControlCommand) -> bool {
        if self.closing {
            debug!("ignoring open command while closing");
            return true;
        }
        let Some(creds) = self.creds.clone() else {
            return false;
        };
        let Some(channel) = command.channel else {
            warn!("open command without a channel");
            return false;
        };
        if self.by_channel.contains_key(&channel) {
            warn!(channel, "cannot open a channel with the same number as another channel");
            return false;
        }
        self.closed_channels.remove(&channel);

        let options = &command.options;
        let host = options
            .get("host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost");

        let creds = match options.get("user").and_then(Value::as_str).filter(|u| !u.is_empty()) {
            Some(user) => {
                let password = options
                    .get("password")
                    .and_then(Value::as_str)
                    .map(|p| Secret::new(p.to_owned()));
                Arc::new(creds.for_user(user, password))
            }
            None => creds,
        };

        let key = (host.to_owned(), creds.user().to_owned());
        let sref = match self.by_host_user.get(&key) {
            Some(sref) => *sref,
            None => {
                let sref = self.next_ref;
                self.next_ref += 1;

                let spawned = if host == "localhost" {
                    self.factory.local(sref, self.events_tx.clone())
                } else {
                    let options = SshTransportOptions {
                        host: host.to_owned(),
                        port: self.config.store.ssh.port,
                        command: self.config.store.ssh.agent_program.clone(),
                        known_hosts: self.config.store.ssh.known_hosts.clone().into(),
                        pinned_host_key: options
                            .get("host-key")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                    };
                    self.factory
                        .ssh(sref, options, creds.clone(), self.events_tx.clone())
                };

                let transport = match spawned {
                    Ok(transport) => transport,
                    Err(error) => {
                        warn!(%host, %error, "couldn't start a session transport");
                        self.closed_channels.insert(channel);
                        self.report_close(channel, Some(Problem::InternalError), &Map::new());
                        return true;
                    }
                };

                info!(%host, user = %creds.user(), "new session");
                self.sessions.insert(
                    sref,
                    Session {
                        key: key.clone(),
                        transport,
                        channels: Vec::new(),
                        creds: creds.clone(),
                        sent_eof: false,
                        idle_generation: 0,
                    },
                );
                self.by_host_user.insert(key, sref);
                sref
            }
        };

        self.add_channel(sref, channel);
        true
    }

    fn inbound_protocol_error(&mut self) {
        self.report_close(0, Some(Problem::ProtocolError), &Map::new());
        self.begin_close();
    }

    /* -----------------------------------------------------------------
     * Bridge → gateway
     */

    fn handle_transport_event(&mut self, sref: TransportRef, event: TransportEvent) {
        match event {
            TransportEvent::Recv(channel, payload) => match self.by_channel.get(&channel) {
                Some(owner) if *owner == sref => self.send_frame(channel, &payload),
                _ => {
                    // One bridge may not speak on another's channels.
                    warn!(channel, "received message with wrong channel from session");
                    self.outbound_protocol_error(sref);
                }
            },
            TransportEvent::Control(command) => {
                self.dispatch_outbound_command(sref, command);
            }
            TransportEvent::Closed { problem, extras } => {
                self.destroy_session(sref, problem, extras);
            }
        }
    }

    fn dispatch_outbound_command(&mut self, sref: TransportRef, command: ControlCommand) {
        let valid = match command.channel {
            None => match command.command.as_str() {
                "authorize" => self.relay_authorize(sref, &command),
                "ping" | "pong" => true,
                other => {
                    warn!(command = %other, "received a control command without a channel");
                    false
                }
            },
            Some(channel) => match self.by_channel.get(&channel) {
                Some(owner) if *owner == sref => {
                    if command.command == "close" {
                        self.remove_channel(sref, channel);
                        self.closed_channels.insert(channel);
                    }
                    self.send_frame(0, &command.to_bytes());
                    true
                }
                _ => {
                    warn!(channel, "received a command with wrong channel from session");
                    false
                }
            },
        };

        if !valid {
            self.outbound_protocol_error(sref);
        }
    }

    fn relay_authorize(&mut self, sref: TransportRef, command: &ControlCommand) -> bool {
        let Some(session) = self.sessions.get(&sref) else {
            return false;
        };
        match process_authorize(&session.creds, &command.options) {
            Some(reply) => {
                if !session.sent_eof {
                    session
                        .transport
                        .send(0, Bytes::from(reply.to_string().into_bytes()));
                }
                true
            }
            None => {
                warn!(host = %session.key.0, "received invalid authorize command");
                false
            }
        }
    }

    fn outbound_protocol_error(&mut self, sref: TransportRef) {
        if let Some(session) = self.sessions.get(&sref) {
            session.transport.close(Some(Problem::ProtocolError));
        }
    }

    /// Report every channel closed and forget the session.
    fn destroy_session(
        &mut self,
        sref: TransportRef,
        problem: Option<Problem>,
        extras: Map<String, Value>,
    ) {
        let Some(session) = self.sessions.remove(&sref) else {
            return;
        };
        self.by_host_user.remove(&session.key);
        for channel in &session.channels {
            self.by_channel.remove(channel);
            self.closed_channels.insert(*channel);
            self.report_close(*channel, problem, &extras);
        }
        info!(host = %session.key.0, ?problem, "session closed");
    }

    /* -----------------------------------------------------------------
     * Channel and timer bookkeeping
     */

    fn add_channel(&mut self, sref: TransportRef, channel: ChannelId) {
        self.by_channel.insert(channel, sref);
        if let Some(session) = self.sessions.get_mut(&sref) {
            session.channels.push(channel);
            session.idle_generation += 1;
            debug!(host = %session.key.0, channel, "added channel to session");
        }
    }

    fn remove_channel(&mut self, sref: TransportRef, channel: ChannelId) {
        self.by_channel.remove(&channel);
        let idle_timeout = self.config.store.session_idle_timeout;
        if let Some(session) = self.sessions.get_mut(&sref) {
            session.channels.retain(|c| *c != channel);
            debug!(host = %session.key.0, channel, "removed channel from session");
            if session.channels.is_empty() {
                // Reap the session if nothing reattaches in time.
                session.idle_generation += 1;
                let generation = session.idle_generation;
                let timer_tx = self.timer_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(idle_timeout).await;
                    let _ = timer_tx.send((sref, generation));
                });
            }
        }
    }

    fn handle_idle_timeout(&mut self, sref: TransportRef, generation: u64) {
        if let Some(session) = self.sessions.get(&sref) {
            if session.idle_generation == generation && session.channels.is_empty() {
                debug!(host = %session.key.0, "session timed out without channels");
                session.transport.close(Some(Problem::Timeout));
            }
        }
    }

    /* -----------------------------------------------------------------
     * Gateway → browser
     */

    fn send_frame(&self, channel: ChannelId, payload: &[u8]) {
        let _ = self.browser_tx.send(encode_frame(channel, payload));
    }

    fn send_control(&self, value: &Value) {
        self.send_frame(0, value.to_string().as_bytes());
    }

    fn report_close(&self, channel: ChannelId, problem: Option<Problem>, extras: &Map<String, Value>) {
        let mut close = Map::new();
        close.insert("command".into(), Value::from("close"));
        if channel != 0 {
            close.insert("channel".into(), Value::from(channel));
        }
        if let Some(problem) = problem {
            close.insert("problem".into(), Value::from(problem.as_str()));
        }
        for (key, value) in extras {
            close.insert(key.clone(), value.clone());
        }
        self.send_control(&Value::Object(close));
    }

    /// Start (or continue) shutting down; the run loop ends once the
    /// last session is gone.
    fn begin_close(&mut self) {
        if !self.closing {
            debug!("browser connection closing");
            self.closing = true;
            for session in self.sessions.values_mut() {
                session.sent_eof = true;
                session.transport.close(None);
            }
        }
    }
}
