//! Wire packet: fixed header plus a JSON payload.
//!
//! Layout (big-endian):
//!
//! ```text
//! byte 0      action (low 7 bits) | impulse (bit 7)
//! byte 1      peer status
//! bytes 2..6  packet id
//! bytes 6..10 stream id
//! bytes 10..  payload (JSON, empty means null)
//! ```

use serde_json::Value as Json;

use crate::error::{NetronError, Result};

const HEADER_LEN: usize = 10;
const IMPULSE_BIT: u8 = 0x80;

/// Action codes understood by every hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Set = 0,
    Get = 1,
    Ping = 2,
    ContextAttach = 3,
    ContextDetach = 4,
    EventOn = 5,
    EventOff = 6,
    EventEmit = 7,
    StreamRequest = 8,
    StreamAccept = 9,
    StreamData = 10,
    StreamPause = 11,
    StreamResume = 12,
    StreamEnd = 13,
}

impl Action {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Set,
            1 => Self::Get,
            2 => Self::Ping,
            3 => Self::ContextAttach,
            4 => Self::ContextDetach,
            5 => Self::EventOn,
            6 => Self::EventOff,
            7 => Self::EventEmit,
            8 => Self::StreamRequest,
            9 => Self::StreamAccept,
            10 => Self::StreamData,
            11 => Self::StreamPause,
            12 => Self::StreamResume,
            13 => Self::StreamEnd,
            _ => return None,
        })
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::StreamRequest
                | Self::StreamAccept
                | Self::StreamData
                | Self::StreamPause
                | Self::StreamResume
                | Self::StreamEnd
        )
    }
}

/// Connection state of a peer, as seen by the side that sent the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PeerStatus {
    Connecting = 0,
    Handshaking = 1,
    Online = 2,
    Offline = 3,
}

impl PeerStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Online,
            3 => Self::Offline,
            _ => return None,
        })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u32,
    /// Correlates a reply with its request; a reply reuses the request's value.
    pub stream_id: u32,
    /// `true` for a request that expects a reply, `false` for the reply itself.
    pub impulse: bool,
    pub action: Action,
    pub status: PeerStatus,
    pub payload: Json,
}

impl Packet {
    pub fn new(
        id: u32,
        stream_id: u32,
        impulse: bool,
        action: Action,
        status: PeerStatus,
        payload: Json,
    ) -> Self {
        Self {
            id,
            stream_id,
            impulse,
            action,
            status,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = if self.payload.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.payload)?
        };

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        let mut flags = self.action as u8;
        if self.impulse {
            flags |= IMPULSE_BIT;
        }
        buf.push(flags);
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(NetronError::MalformedPacket(format!(
                "truncated header: {} of {HEADER_LEN} bytes",
                bytes.len()
            )));
        }

        let action_code = bytes[0] & !IMPULSE_BIT;
        let action = Action::from_code(action_code).ok_or_else(|| {
            NetronError::MalformedPacket(format!("unknown action code {action_code}"))
        })?;
        let status = PeerStatus::from_code(bytes[1]).ok_or_else(|| {
            NetronError::MalformedPacket(format!("unknown peer status {}", bytes[1]))
        })?;
        let id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let stream_id = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);

        let body = &bytes[HEADER_LEN..];
        let payload = if body.is_empty() {
            Json::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|e| NetronError::MalformedPacket(format!("bad payload: {e}")))?
        };

        Ok(Self {
            id,
            stream_id,
            impulse: bytes[0] & IMPULSE_BIT != 0,
            action,
            status,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
