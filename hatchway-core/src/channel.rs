//! Per-channel payload machinery. Each concrete channel runs as its own
//! task: the router feeds it ops, the channel reports events tagged with
//! its id, and it emits exactly one `Closed` event.

mod http;
mod stream;

pub use http::{parse_keep_alive, ChunkedDecoder, HttpChannel, HttpPool};
pub use stream::StreamChannel;

use bytes::Bytes;
use hatchway_common::{ChannelId, Problem};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::frame::ControlCommand;

#[derive(Debug)]
pub enum ChannelOp {
    /// Payload from the browser.
    Recv(Bytes),
    /// The browser has no further payload for this channel.
    Done,
    Close(Option<Problem>),
}

#[derive(Debug)]
pub enum ChannelEvent {
    Ready,
    /// Payload towards the browser.
    Data(Bytes),
    Done,
    Closed {
        problem: Option<Problem>,
        extras: Map<String, Value>,
    },
}

impl ChannelEvent {
    pub fn closed(problem: Option<Problem>) -> Self {
        ChannelEvent::Closed {
            problem,
            extras: Map::new(),
        }
    }
}

pub type ChannelEventTx = UnboundedSender<(ChannelId, ChannelEvent)>;

#[derive(Debug)]
pub struct ChannelHandle {
    pub ops_tx: UnboundedSender<ChannelOp>,
}

impl ChannelHandle {
    pub fn recv(&self, data: Bytes) {
        let _ = self.ops_tx.send(ChannelOp::Recv(data));
    }

    pub fn done(&self) {
        let _ = self.ops_tx.send(ChannelOp::Done);
    }

    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.ops_tx.send(ChannelOp::Close(problem));
    }
}

/// The immutable options of an `open` command, with typed accessors.
/// Wrongly-typed values read as absent; the channels reject whatever they
/// cannot live without.
#[derive(Debug, Clone)]
pub struct OpenOptions(Map<String, Value>);

impl OpenOptions {
    pub fn from_command(command: &ControlCommand) -> Self {
        Self(command.options.clone())
    }

    #[cfg(test)]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self(Map::new()),
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn bool(&self, name: &str, default: bool) -> bool {
        self.0
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn strv(&self, name: &str) -> Option<Vec<String>> {
        let list = self.0.get(name)?.as_array()?;
        list.iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
    }

    pub fn object(&self, name: &str) -> Option<&Map<String, Value>> {
        self.0.get(name).and_then(Value::as_object)
    }
}

/// Map an endpoint I/O failure onto a close problem.
pub(crate) fn io_problem(error: &std::io::Error) -> Problem {
    match error.kind() {
        std::io::ErrorKind::NotFound => Problem::NotFound,
        std::io::ErrorKind::PermissionDenied => Problem::PermissionDenied,
        _ => Problem::InternalError,
    }
}
