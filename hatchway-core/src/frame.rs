//! The framed multiplexing wire format. Every message is an ASCII decimal
//! channel id, a line feed and an opaque payload; channel 0 carries JSON
//! control commands. Byte-stream carriers (child stdio, SSH channels)
//! additionally prefix each message with its length so boundaries survive.

use bytes::{BufMut, Bytes, BytesMut};
use hatchway_common::json::json_skip_with_spaces;
use hatchway_common::ChannelId;
use serde_json::Value;

/// Messages bigger than this on a byte-stream carrier are rejected rather
/// than buffered.
const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("message without channel prefix")]
    MissingSeparator,
    #[error("invalid message prefix")]
    BadPrefix,
    #[error("invalid message length framing")]
    BadLength,
    #[error("control message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control message is not an object")]
    NotAnObject,
    #[error("control message has an invalid or missing command")]
    BadCommand,
    #[error("control message has an invalid channel")]
    BadChannel,
    #[error("truncated control message")]
    Truncated,
}

pub fn encode_frame(channel: ChannelId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 12);
    buf.put_slice(channel.to_string().as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a message into its channel id and payload. Only the first line
/// feed separates; the payload may contain any bytes.
pub fn parse_frame(message: &[u8]) -> Result<(ChannelId, &[u8]), FrameError> {
    let line = message
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(FrameError::MissingSeparator)?;
    let prefix = &message[..line];
    if prefix.is_empty() || !prefix.iter().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::BadPrefix);
    }
    let channel = std::str::from_utf8(prefix)
        .map_err(|_| FrameError::BadPrefix)?
        .parse::<ChannelId>()
        .map_err(|_| FrameError::BadPrefix)?;
    Ok((channel, &message[line + 1..]))
}

/// One parsed control command from channel 0.
#[derive(Debug, Clone)]
pub struct ControlCommand {
    pub command: String,
    pub channel: Option<ChannelId>,
    pub options: serde_json::Map<String, Value>,
}

impl ControlCommand {
    pub fn to_bytes(&self) -> Bytes {
        let value = Value::Object(self.options.clone());
        Bytes::from(value.to_string().into_bytes())
    }
}

/// Parse a single control command: a JSON object with a non-empty
/// `command` string and an optional positive-integer `channel`.
pub fn parse_command(payload: &[u8]) -> Result<ControlCommand, FrameError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(options) = value else {
        return Err(FrameError::NotAnObject);
    };

    let command = match options.get("command") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(FrameError::BadCommand),
    };

    let channel = match options.get("channel") {
        None => None,
        Some(Value::Number(n)) => {
            let n = n.as_i64().ok_or(FrameError::BadChannel)?;
            if n <= 0 || n > u32::MAX as i64 {
                return Err(FrameError::BadChannel);
            }
            Some(n as ChannelId)
        }
        Some(_) => return Err(FrameError::BadChannel),
    };

    Ok(ControlCommand {
        command,
        channel,
        options,
    })
}

/// A control payload may hold several concatenated JSON objects; parse
/// them all, in order.
pub fn parse_commands(payload: &[u8]) -> Result<Vec<ControlCommand>, FrameError> {
    let mut commands = Vec::new();
    let mut data = payload;
    while !data.is_empty() {
        let (off, spaces) = json_skip_with_spaces(data);
        if off == 0 {
            return Err(FrameError::Truncated);
        }
        if spaces == off {
            break;
        }
        commands.push(parse_command(&data[..off])?);
        data = &data[off..];
    }
    Ok(commands)
}

/// Length-prefixed message framing for carriers without message
/// boundaries: `<decimal-length>\n<frame>`.
pub fn encode_message(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.len() + 12);
    buf.put_slice(frame.len().to_string().as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(frame);
    buf.freeze()
}

/// Incremental decoder for the length-prefixed message stream.
#[derive(Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame, or None until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Some(line) = self.buf.iter().position(|b| *b == b'\n') else {
            // A length prefix longer than the maximum message size can
            // never become valid.
            if self.buf.len() > 20 {
                return Err(FrameError::BadLength);
            }
            return Ok(None);
        };

        let prefix = &self.buf[..line];
        if prefix.is_empty() || !prefix.iter().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::BadLength);
        }
        let length = std::str::from_utf8(prefix)
            .map_err(|_| FrameError::BadLength)?
            .parse::<usize>()
            .map_err(|_| FrameError::BadLength)?;
        if length > MAX_MESSAGE_SIZE {
            return Err(FrameError::BadLength);
        }

        if self.buf.len() < line + 1 + length {
            return Ok(None);
        }

        let _ = self.buf.split_to(line + 1);
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let encoded = encode_frame(444, b"payload");
        assert_eq!(&encoded[..], b"444\npayload");
        let (channel, payload) = parse_frame(&encoded).unwrap();
        assert_eq!(channel, 444);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_frame_only_first_newline_separates() {
        let (channel, payload) = parse_frame(b"7\nline one\nline two\n").unwrap();
        assert_eq!(channel, 7);
        assert_eq!(payload, b"line one\nline two\n");
    }

    #[test]
    fn test_frame_invalid_prefix() {
        assert!(parse_frame(b"no newline here").is_err());
        assert!(parse_frame(b"\npayload").is_err());
        assert!(parse_frame(b"12x\npayload").is_err());
        assert!(parse_frame(b"-4\npayload").is_err());
        assert!(parse_frame(b"99999999999\npayload").is_err());
    }

    #[test]
    fn test_parse_command() {
        let cmd = parse_command(br#"{"command":"open","channel":4,"payload":"stream"}"#).unwrap();
        assert_eq!(cmd.command, "open");
        assert_eq!(cmd.channel, Some(4));
        assert_eq!(
            cmd.options.get("payload"),
            Some(&Value::String("stream".into()))
        );
    }

    #[test]
    fn test_parse_command_without_channel() {
        let cmd = parse_command(br#"{"command":"ping"}"#).unwrap();
        assert_eq!(cmd.channel, None);
    }

    #[test]
    fn test_parse_command_invalid() {
        assert!(parse_command(b"[1,2,3]").is_err());
        assert!(parse_command(br#"{"command":""}"#).is_err());
        assert!(parse_command(br#"{"channel":4}"#).is_err());
        assert!(parse_command(br#"{"command":"x","channel":0}"#).is_err());
        assert!(parse_command(br#"{"command":"x","channel":-2}"#).is_err());
        assert!(parse_command(br#"{"command":"x","channel":"4"}"#).is_err());
        assert!(parse_command(b"not json").is_err());
    }

    #[test]
    fn test_parse_concatenated_commands() {
        let payload = br#"{"command":"close","channel":4} {"command":"ping"}"#;
        let commands = parse_commands(payload).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "close");
        assert_eq!(commands[1].command, "ping");
    }

    #[test]
    fn test_parse_commands_truncated() {
        assert!(parse_commands(br#"{"command":"close","chan"#).is_err());
    }

    #[test]
    fn test_message_decoder() {
        let mut decoder = MessageDecoder::new();
        let message = encode_message(b"0\n{\"command\":\"ping\"}");

        // Feed one byte at a time; the frame appears only when complete.
        for (at, byte) in message.iter().enumerate() {
            decoder.extend(&[*byte]);
            let result = decoder.next_message().unwrap();
            if at + 1 < message.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(&result.unwrap()[..], b"0\n{\"command\":\"ping\"}");
            }
        }
    }

    #[test]
    fn test_message_decoder_back_to_back() {
        let mut decoder = MessageDecoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_message(b"1\nfirst"));
        stream.extend_from_slice(&encode_message(b"2\nsecond"));
        decoder.extend(&stream);

        assert_eq!(&decoder.next_message().unwrap().unwrap()[..], b"1\nfirst");
        assert_eq!(&decoder.next_message().unwrap().unwrap()[..], b"2\nsecond");
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_message_decoder_bad_length() {
        let mut decoder = MessageDecoder::new();
        decoder.extend(b"bogus\ndata");
        assert!(decoder.next_message().is_err());
    }
}
