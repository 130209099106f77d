//! Wire frame types and the JSON codec that (de)serializes them.
//!
//! Splits a typed frame representation ([`IncomingFrame`]/[`OutgoingFrame`])
//! from a [`tokio_util::codec`] `Encoder`/`Decoder` pair that frames it as
//! length-delimited JSON records on the wire.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ErrorKind};

/// Maximum accepted length of a client-supplied request id, in bytes (spec §4.2).
pub const MAX_ID_LEN: usize = 128;

/// Maximum accepted frame length before the codec refuses to buffer further bytes.
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// An incoming frame as received from a client (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub frame_type: Option<String>,
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl IncomingFrame {
    /// Validate the structural invariants spec §4.2 requires before dispatch:
    /// action alphabet, id length, and that `type`, if present, is `"request"`.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(ref t) = self.frame_type {
            if t != "request" {
                return Err(Error::validation(format!("unsupported frame type '{t}'")));
            }
        }

        if self.action.is_empty()
            || !self
                .action
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::validation(format!(
                "action '{}' contains characters outside [A-Za-z0-9._-]",
                self.action
            )));
        }

        if let Some(ref id) = self.id {
            if id.len() > MAX_ID_LEN {
                return Err(Error::validation(format!(
                    "id exceeds {MAX_ID_LEN} bytes"
                )));
            }
        }

        Ok(())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let frame: IncomingFrame =
            serde_json::from_slice(bytes).map_err(|e| {
                Error::with_source(ErrorKind::Validation, "request body is not well-formed", e)
            })?;
        frame.validate()?;
        Ok(frame)
    }
}

/// An outgoing frame, tagged by `type` (spec §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingFrame {
    #[serde(rename = "response")]
    Response {
        request_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    #[serde(rename = "acknowledgment")]
    Acknowledgment {
        request_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        status: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_duration: Option<f64>,
    },
    #[serde(rename = "progress")]
    Progress {
        request_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        percentage: f64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
        error: WireError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl OutgoingFrame {
    pub fn error_frame(request_id: Option<String>, error: &Error) -> Self {
        OutgoingFrame::Error {
            request_id,
            timestamp: chrono::Utc::now(),
            error: WireError {
                code: error.code(),
                message: error.message.clone(),
                details: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes, Error> {
        serde_json::to_vec(self)
            .map(bytes::Bytes::from)
            .map_err(Error::from)
    }
}

/// Length-delimited JSON codec: a 4-byte big-endian length prefix followed by
/// the JSON payload.
#[derive(Debug, Default)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodeState {
    #[default]
    Length,
    Payload(u32),
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::Length => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes(src[..4].try_into().unwrap());
                    if len as usize > MAX_FRAME_LEN {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "frame exceeds maximum length",
                        ));
                    }
                    src.advance(4);
                    src.reserve(len as usize);
                    self.state = DecodeState::Payload(len);
                }
                DecodeState::Payload(len) => {
                    if src.len() < len as usize {
                        return Ok(None);
                    }
                    let payload = src.split_to(len as usize);
                    self.state = DecodeState::Length;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

impl Encoder<bytes::Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: bytes::Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        if item.len() > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum length",
            ));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put(item);
        Ok(())
    }
}
