//! Wire Codec
//!
//! Turns [`Message`]s into transport [`Frame`]s and back.
//!
//! Text frames carry one JSON object discriminated by `type`. Binary frames,
//! available only on connections that negotiated `mcp.binary.v1`, carry an
//! 8-byte big-endian header followed by the same JSON in compact form:
//!
//! ```text
//! 0       1       2       3       4                               8
//! +-------+-------+-------+-------+-------------------------------+
//! |version| flags | kind  |  rsv  |        payload length         |
//! +-------+-------+-------+-------+-------------------------------+
//! |                       payload (JSON)                          |
//! ```

use meshgate_core::{
    EncodingInfo, FormatError, Frame, Message, MessageKind, ProtocolError, RecvError,
};

/// Current binary frame version.
pub const BINARY_VERSION: u8 = 0x01;

/// Binary header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Reserved for payload compression. Never set by this encoder.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Codec knobs shared by every connection.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub binary_threshold: usize,
    pub binary_kinds: Vec<MessageKind>,
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            binary_threshold: 1024,
            binary_kinds: vec![MessageKind::TaskExecute, MessageKind::TaskResult],
            max_message_size: 1024 * 1024,
        }
    }
}

/// Per-connection codec.
#[derive(Debug, Clone)]
pub struct WireCodec {
    config: CodecConfig,
    binary: bool,
}

impl WireCodec {
    /// `binary` is the negotiation outcome for this connection.
    pub fn new(config: CodecConfig, binary: bool) -> Self {
        Self { config, binary }
    }

    pub fn text_only(config: CodecConfig) -> Self {
        Self::new(config, false)
    }

    pub fn binary_negotiated(&self) -> bool {
        self.binary
    }

    /// What `agent.registered` advertises.
    pub fn encoding_info(&self) -> EncodingInfo {
        EncodingInfo {
            binary: self.binary,
            threshold: self.config.binary_threshold,
        }
    }

    /// Encode one message into a single frame.
    pub fn encode(&self, message: &Message) -> Result<Frame, FormatError> {
        let json = serde_json::to_vec(message).map_err(|e| FormatError::Encode {
            reason: e.to_string(),
        })?;

        if self.wants_binary(message.kind(), json.len()) {
            return encode_binary(message.kind(), &json).map(Frame::Binary);
        }

        String::from_utf8(json)
            .map(Frame::Text)
            .map_err(|e| FormatError::Encode {
                reason: e.to_string(),
            })
    }

    fn wants_binary(&self, kind: MessageKind, encoded_len: usize) -> bool {
        self.binary
            && (encoded_len > self.config.binary_threshold
                || self.config.binary_kinds.contains(&kind))
    }

    /// Decode one data frame.
    ///
    /// A binary frame on a text-only connection is a protocol error and
    /// fatal for the connection. Anything else that fails is a
    /// [`FormatError`] scoped to this frame.
    pub fn decode(&self, frame: &Frame) -> Result<Message, RecvError> {
        if frame.len() > self.config.max_message_size {
            return Err(FormatError::TooLarge {
                size: frame.len(),
                limit: self.config.max_message_size,
            }
            .into());
        }

        match frame {
            Frame::Text(text) => decode_text(text).map_err(RecvError::from),
            Frame::Binary(bytes) => {
                if !self.binary {
                    return Err(ProtocolError::BinaryNotNegotiated.into());
                }
                decode_binary(bytes).map_err(RecvError::from)
            }
            Frame::Control | Frame::Close { .. } => Err(FormatError::Malformed {
                reason: format!("{} frame carries no message", frame.encoding()),
            }
            .into()),
        }
    }
}

/// Parse a JSON text frame.
pub fn decode_text(text: &str) -> Result<Message, FormatError> {
    serde_json::from_str(text).map_err(|e| FormatError::Malformed {
        reason: e.to_string(),
    })
}

/// Build a binary frame around an already-encoded JSON payload.
pub fn encode_binary(kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    let len = u32::try_from(payload.len()).map_err(|_| FormatError::TooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(BINARY_VERSION);
    frame.push(0);
    frame.push(kind.code());
    frame.push(0);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a binary frame, validating every header field.
pub fn decode_binary(bytes: &[u8]) -> Result<Message, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != BINARY_VERSION {
        return Err(FormatError::UnsupportedVersion { version });
    }

    // No flag is defined yet, the compression bit included.
    let flags = bytes[1];
    if flags != 0 {
        return Err(FormatError::UnknownFlags { flags });
    }

    let kind = MessageKind::from_code(bytes[2]).ok_or(FormatError::UnknownKind { code: bytes[2] })?;

    if bytes[3] != 0 {
        return Err(FormatError::Malformed {
            reason: "reserved header byte is not zero".to_string(),
        });
    }

    let declared = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() < declared {
        return Err(FormatError::Truncated {
            needed: HEADER_LEN + declared,
            got: bytes.len(),
        });
    }
    if payload.len() > declared {
        return Err(FormatError::Malformed {
            reason: format!(
                "{} trailing bytes after payload",
                payload.len() - declared
            ),
        });
    }

    let message: Message = serde_json::from_slice(payload).map_err(|e| FormatError::Malformed {
        reason: e.to_string(),
    })?;
    if message.kind() != kind {
        return Err(FormatError::KindMismatch {
            header: kind.to_string(),
            payload: message.kind().to_string(),
        });
    }
    Ok(message)
}
