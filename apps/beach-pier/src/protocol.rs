use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned by the connection registry to a live websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a two-party session. Clients echo it back on every signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn generate() -> Self {
        Self(format!("room_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind tag of a relayed signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque signaling message. The payload is kept as the exact JSON text the
/// sender produced and is never parsed past the outer frame.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: SignalKind,
    pub payload: Box<RawValue>,
}

impl Envelope {
    pub fn new(kind: SignalKind, payload: Box<RawValue>) -> Self {
        Self { kind, payload }
    }

    pub fn payload(&self) -> &str {
        self.payload.get()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{0}` message is missing roomId")]
    MissingRoom(SignalKind),
}

/// Messages sent from a client to the pier
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Ask to be paired with the next waiting client
    FindMatch,
    /// Relay a signaling envelope to the other member of `room_id`
    Signal { room_id: RoomId, envelope: Envelope },
    /// Keepalive
    Ping,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room_id: Option<RoomId>,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        match frame.kind.as_str() {
            "find-match" => Ok(ClientMessage::FindMatch),
            "ping" => Ok(ClientMessage::Ping),
            tag => {
                let kind = SignalKind::from_tag(tag)
                    .ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;
                let room_id = frame.room_id.ok_or(ProtocolError::MissingRoom(kind))?;
                // An explicit `null` payload (end-of-candidates) is relayed as `null`.
                let payload = match frame.payload {
                    Some(payload) => payload,
                    None => RawValue::from_string("null".to_string())?,
                };
                Ok(ClientMessage::Signal {
                    room_id,
                    envelope: Envelope::new(kind, payload),
                })
            }
        }
    }
}

/// Messages sent from the pier to a client
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// First frame on every connection
    Welcome { connection_id: ConnectionId },
    /// Sent to both members once a pairing succeeds
    MatchFound {
        room_id: RoomId,
        initiator: ConnectionId,
    },
    /// Envelope relayed from the session peer
    Signal {
        room_id: RoomId,
        from: ConnectionId,
        envelope: Envelope,
    },
    /// The other member of `room_id` disconnected
    PeerLeft { room_id: RoomId },
    /// Evicted from the waiting queue after the residency timeout
    QueueTimeout,
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::MatchFound { .. } => "match-found",
            ServerMessage::Signal { envelope, .. } => envelope.kind.as_str(),
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::QueueTimeout => "queue-timeout",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn frame(&self) -> OutboundFrame<'_> {
        match self {
            ServerMessage::Welcome { connection_id } => OutboundFrame::Welcome {
                connection_id: *connection_id,
            },
            ServerMessage::MatchFound { room_id, initiator } => OutboundFrame::MatchFound {
                room_id,
                initiator: *initiator,
            },
            ServerMessage::Signal {
                room_id,
                from,
                envelope,
            } => {
                let relayed = RelayedFrame {
                    room_id,
                    from: *from,
                    payload: &envelope.payload,
                };
                match envelope.kind {
                    SignalKind::Offer => OutboundFrame::Offer(relayed),
                    SignalKind::Answer => OutboundFrame::Answer(relayed),
                    SignalKind::IceCandidate => OutboundFrame::IceCandidate(relayed),
                }
            }
            ServerMessage::PeerLeft { room_id } => OutboundFrame::PeerLeft { room_id },
            ServerMessage::QueueTimeout => OutboundFrame::QueueTimeout,
            ServerMessage::Pong => OutboundFrame::Pong,
            ServerMessage::Error { message } => OutboundFrame::Error { message },
        }
    }
}

impl Serialize for ServerMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.frame().serialize(serializer)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum OutboundFrame<'a> {
    Welcome {
        connection_id: ConnectionId,
    },
    MatchFound {
        room_id: &'a RoomId,
        initiator: ConnectionId,
    },
    Offer(RelayedFrame<'a>),
    Answer(RelayedFrame<'a>),
    IceCandidate(RelayedFrame<'a>),
    PeerLeft {
        room_id: &'a RoomId,
    },
    QueueTimeout,
    Pong,
    Error {
        message: &'a str,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayedFrame<'a> {
    room_id: &'a RoomId,
    from: ConnectionId,
    payload: &'a RawValue,
}
