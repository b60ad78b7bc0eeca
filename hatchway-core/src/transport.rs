//! Transports carry frames between the gateway and a bridge: a helper
//! process on this host, or an agent reached over SSH. Either way the
//! session manager sees the same thing: a handle to send and close, and a
//! tagged event stream of incoming frames.

mod local;
pub mod known_hosts;
mod ssh;

pub use local::LocalTransport;
pub use ssh::{SshTransport, SshTransportOptions};

use bytes::Bytes;
use hatchway_common::{ChannelId, Problem};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::frame::ControlCommand;

/// Identifies a transport (and its session) in the event stream.
pub type TransportRef = u64;

#[derive(Debug)]
pub enum TransportCommand {
    Send(ChannelId, Bytes),
    /// Pause or resume reading from the bridge.
    SetPressure(bool),
    Close(Option<Problem>),
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A payload frame from the bridge.
    Recv(ChannelId, Bytes),
    /// A control command from the bridge.
    Control(ControlCommand),
    /// Terminal; the extras carry remediation detail such as the observed
    /// host key on `unknown-hostkey`.
    Closed {
        problem: Option<Problem>,
        extras: Map<String, Value>,
    },
}

pub type TransportEventTx = UnboundedSender<(TransportRef, TransportEvent)>;
pub type TransportEventRx = UnboundedReceiver<(TransportRef, TransportEvent)>;

/// The single write side of a transport. Cloneable, but the session
/// manager serializes all sends through its own loop.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(tx: UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }

    pub fn send(&self, channel: ChannelId, payload: Bytes) {
        let _ = self.tx.send(TransportCommand::Send(channel, payload));
    }

    pub fn set_pressure(&self, on: bool) {
        let _ = self.tx.send(TransportCommand::SetPressure(on));
    }

    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.tx.send(TransportCommand::Close(problem));
    }
}

pub(crate) fn closed_event(problem: Option<Problem>) -> TransportEvent {
    TransportEvent::Closed {
        problem,
        extras: Map::new(),
    }
}
