//! Frames over an SSH connection: the gateway dials the remote host with
//! the session credentials and runs the agent program, whose stdio speaks
//! the same length-prefixed framing as a local bridge.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use hatchway_common::{Credentials, Problem};
use russh::keys::{HashAlg, PublicKey};
use russh::ChannelMsg;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::frame::{encode_frame, encode_message, MessageDecoder};
use crate::transport::known_hosts::{KnownHostValidationResult, KnownHosts};
use crate::transport::local::dispatch_messages;
use crate::transport::{
    TransportCommand, TransportEvent, TransportEventTx, TransportHandle, TransportRef,
};

#[derive(Debug, Clone)]
pub struct SshTransportOptions {
    pub host: String,
    pub port: u16,
    /// Command executed on the remote host; its stdio carries the frames.
    pub command: String,
    pub known_hosts: PathBuf,
    /// `open` may pin the expected host key (`<type> <base64>`); the pin
    /// takes precedence over the known-hosts file.
    pub pinned_host_key: Option<String>,
}

/// What the server presented during key exchange, kept for the
/// `unknown-hostkey` close extras.
#[derive(Debug, Clone)]
struct ObservedHostKey {
    key: String,
    fingerprint: String,
}

#[derive(Debug, thiserror::Error)]
enum SshFailure {
    #[error("host key rejected")]
    HostKeyRejected,
    #[error("authentication failed")]
    Authentication,
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SshFailure {
    fn problem(&self) -> Problem {
        match self {
            SshFailure::HostKeyRejected => Problem::UnknownHostkey,
            SshFailure::Authentication => Problem::AuthenticationFailed,
            // russh reports a handler veto as a key rejection too.
            SshFailure::Ssh(russh::Error::UnknownKey) => Problem::UnknownHostkey,
            _ => Problem::InternalError,
        }
    }
}

struct ClientHandler {
    options: SshTransportOptions,
    observed: Arc<StdMutex<Option<ObservedHostKey>>>,
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let openssh = server_public_key
            .to_openssh()
            .map_err(|_| russh::Error::UnknownKey)?;
        let mut fields = openssh.split_whitespace();
        let (Some(key_type), Some(key_base64)) = (fields.next(), fields.next()) else {
            return Err(russh::Error::UnknownKey);
        };

        *self.observed.lock().unwrap_or_else(|e| e.into_inner()) = Some(ObservedHostKey {
            key: format!("{key_type} {key_base64}"),
            fingerprint: server_public_key.fingerprint(HashAlg::Sha256).to_string(),
        });

        if let Some(pinned) = &self.options.pinned_host_key {
            let accepted = pinned.split_whitespace().eq([key_type, key_base64]);
            if !accepted {
                warn!(host = %self.options.host, "host key does not match the pinned key");
            }
            return Ok(accepted);
        }

        let known_hosts = KnownHosts::new(&self.options.known_hosts);
        match known_hosts
            .validate(&self.options.host, self.options.port, key_type, key_base64)
            .await
        {
            Ok(KnownHostValidationResult::Valid) => Ok(true),
            Ok(KnownHostValidationResult::Invalid { .. }) => {
                warn!(host = %self.options.host, "host key changed");
                Ok(false)
            }
            Ok(KnownHostValidationResult::Unknown) => {
                warn!(host = %self.options.host, "host key is unknown");
                Ok(false)
            }
            Err(error) => {
                warn!(host = %self.options.host, %error, "failed to read known hosts");
                Ok(false)
            }
        }
    }
}

pub struct SshTransport;

impl SshTransport {
    /// Start connecting; frames flow once the agent is up. Failures are
    /// reported through the event stream like any other transport death.
    pub fn connect(
        sref: TransportRef,
        options: SshTransportOptions,
        creds: Arc<Credentials>,
        events_tx: TransportEventTx,
    ) -> TransportHandle {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(run(sref, options, creds, events_tx, rx));
        TransportHandle::new(tx)
    }
}

async fn run(
    sref: TransportRef,
    options: SshTransportOptions,
    creds: Arc<Credentials>,
    events_tx: TransportEventTx,
    commands_rx: UnboundedReceiver<TransportCommand>,
) {
    let observed = Arc::new(StdMutex::new(None));

    let result = serve(sref, &options, creds, &events_tx, commands_rx, &observed).await;

    let (problem, mut extras) = match result {
        Ok(problem) => (problem, Map::new()),
        Err(failure) => {
            warn!(host = %options.host, error = %failure, "SSH transport failed");
            (Some(failure.problem()), Map::new())
        }
    };

    if problem == Some(Problem::UnknownHostkey) {
        if let Some(key) = observed.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            extras.insert("host-key".into(), Value::from(key.key));
            extras.insert("host-fingerprint".into(), Value::from(key.fingerprint));
        }
    }

    let _ = events_tx.send((sref, TransportEvent::Closed { problem, extras }));
}

async fn serve(
    sref: TransportRef,
    options: &SshTransportOptions,
    creds: Arc<Credentials>,
    events_tx: &TransportEventTx,
    mut commands_rx: UnboundedReceiver<TransportCommand>,
    observed: &Arc<StdMutex<Option<ObservedHostKey>>>,
) -> Result<Option<Problem>, SshFailure> {
    let config = Arc::new(russh::client::Config::default());
    let handler = ClientHandler {
        options: options.clone(),
        observed: observed.clone(),
    };

    info!(host = %options.host, user = %creds.user(), "Connecting");
    let mut handle =
        russh::client::connect(config, (options.host.as_str(), options.port), handler).await?;

    let authenticated = match creds.password() {
        Some(password) => {
            handle
                .authenticate_password(creds.user(), password.expose_secret().clone())
                .await?
        }
        None => handle.authenticate_none(creds.user()).await?,
    };
    if !matches!(authenticated, russh::client::AuthResult::Success) {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        return Err(SshFailure::Authentication);
    }

    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, options.command.as_str()).await?;
    info!(host = %options.host, "Connected");

    let mut decoder = MessageDecoder::new();
    let mut agent_exit: Option<u32> = None;

    loop {
        tokio::select! {
            command = commands_rx.recv() => match command {
                Some(TransportCommand::Send(ch, payload)) => {
                    let message = encode_message(&encode_frame(ch, &payload));
                    channel.data(&message[..]).await?;
                }
                Some(TransportCommand::SetPressure(_)) => {
                    // SSH flow control is the channel window's job.
                }
                Some(TransportCommand::Close(problem)) => {
                    let _ = channel.eof().await;
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "")
                        .await;
                    return Ok(problem);
                }
                None => {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "")
                        .await;
                    return Ok(None);
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    decoder.extend(&data);
                    if !dispatch_messages(sref, &mut decoder, events_tx) {
                        let _ = handle
                            .disconnect(russh::Disconnect::ByApplication, "", "")
                            .await;
                        return Ok(Some(Problem::ProtocolError));
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    let text = String::from_utf8_lossy(&data);
                    warn!(host = %options.host, "agent: {}", text.trim_end());
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    agent_exit = Some(exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!(host = %options.host, ?agent_exit, "agent finished");
                    let problem = match agent_exit {
                        Some(0) | None => None,
                        Some(_) => Some(Problem::InternalError),
                    };
                    return Ok(problem);
                }
                Some(other) => {
                    debug!(?other, "unhandled channel message");
                }
            },
        }
    }
}
