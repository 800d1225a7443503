//! # Codec
//!
//! The boundary to the message layer. The session only needs three things
//! from it: encode a request for stream S, encode a close for stream S, and
//! decode an inbound frame into a `Msg` carrying a stream id, message class
//! and state flags. `JsonCodec` is a self-describing implementation used by the
//! consumer binary and the integration tests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::watchlist::RequestKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    Open,
    NonStreaming,
    Closed,
    ClosedRecover,
    Redirected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataState {
    #[default]
    Ok,
    Suspect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_state: StreamState,
    pub data_state: DataState,
    #[serde(default)]
    pub text: String,
}

impl StreamStatus {
    pub fn new(stream_state: StreamState, data_state: DataState, text: &str) -> Self {
        Self { stream_state, data_state, text: text.to_string() }
    }

    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, "")
    }

    pub fn open_suspect(text: &str) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, text)
    }

    /// Closed, Redirected and the like end the stream for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self.stream_state, StreamState::Closed | StreamState::Redirected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgClass {
    Refresh { complete: bool },
    Update,
    Status,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub stream_id: i32,
    pub class: MsgClass,
    pub state: Option<StreamStatus>,
    pub payload: Value,
}

pub trait Codec: Send + Sync {
    fn encode_request(&self, key: &RequestKey, stream_id: i32) -> Result<Bytes, CodecError>;
    fn encode_close(&self, stream_id: i32) -> Result<Bytes, CodecError>;
    fn decode(&self, frame: &[u8]) -> Result<Msg, CodecError>;
}

/// The JSON frame layout spoken by `JsonCodec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Request {
        stream_id: i32,
        key: RequestKey,
    },
    Close {
        stream_id: i32,
    },
    Refresh {
        stream_id: i32,
        #[serde(default = "default_true")]
        complete: bool,
        #[serde(default)]
        state: Option<StreamStatus>,
        #[serde(default)]
        payload: Value,
    },
    Update {
        stream_id: i32,
        #[serde(default)]
        payload: Value,
    },
    Status {
        stream_id: i32,
        state: StreamStatus,
    },
}

fn default_true() -> bool {
    true
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(frame: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_request(&self, key: &RequestKey, stream_id: i32) -> Result<Bytes, CodecError> {
        WireMessage::Request { stream_id, key: key.clone() }.to_bytes()
    }

    fn encode_close(&self, stream_id: i32) -> Result<Bytes, CodecError> {
        WireMessage::Close { stream_id }.to_bytes()
    }

    fn decode(&self, frame: &[u8]) -> Result<Msg, CodecError> {
        match WireMessage::from_slice(frame)? {
            WireMessage::Refresh { stream_id, complete, state, payload } => {
                Ok(Msg { stream_id, class: MsgClass::Refresh { complete }, state, payload })
            }
            WireMessage::Update { stream_id, payload } => {
                Ok(Msg { stream_id, class: MsgClass::Update, state: None, payload })
            }
            WireMessage::Status { stream_id, state } => {
                Ok(Msg { stream_id, class: MsgClass::Status, state: Some(state), payload: Value::Null })
            }
            other => Err(CodecError::Unexpected(format!("consumer does not accept {:?}", other))),
        }
    }
}
