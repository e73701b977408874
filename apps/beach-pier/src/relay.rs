//! Two-party sessions and the membership checks that scope signaling relay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{ConnectionId, RoomId};

/// A pairing of exactly two connections. Members are referenced by id only;
/// the session never keeps a connection alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub room_id: RoomId,
    pub member_a: ConnectionId,
    pub member_b: ConnectionId,
    /// Sends the first offer. Always the member that requested a match last.
    pub initiator: ConnectionId,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Pair `waiting` (queued earlier) with `requester`, who becomes initiator.
    pub fn pair(waiting: ConnectionId, requester: ConnectionId) -> Self {
        Self {
            room_id: RoomId::generate(),
            member_a: waiting,
            member_b: requester,
            initiator: requester,
            created_at: Utc::now(),
        }
    }

    pub fn members(&self) -> [ConnectionId; 2] {
        [self.member_a, self.member_b]
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.member_a == id || self.member_b == id
    }

    pub fn peer_of(&self, id: ConnectionId) -> Option<ConnectionId> {
        if id == self.member_a {
            Some(self.member_b)
        } else if id == self.member_b {
            Some(self.member_a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("session {0} does not exist")]
    UnknownSession(RoomId),
    #[error("connection {from} is not a member of session {room_id}")]
    UnauthorizedRelay { room_id: RoomId, from: ConnectionId },
    #[error("connection {connection_id} already belongs to session {existing}")]
    Conflict {
        connection_id: ConnectionId,
        existing: RoomId,
    },
}

impl RelayError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::UnknownSession(_) => "unknown_session",
            RelayError::UnauthorizedRelay { .. } => "unauthorized_relay",
            RelayError::Conflict { .. } => "conflict",
        }
    }
}

/// Active sessions keyed by room, with a reverse index from member to room.
#[derive(Debug, Default)]
pub struct SessionRelay {
    sessions: HashMap<RoomId, Session>,
    by_member: HashMap<ConnectionId, RoomId>,
}

impl SessionRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) -> Result<&Session, RelayError> {
        for member in session.members() {
            if let Some(existing) = self.by_member.get(&member) {
                return Err(RelayError::Conflict {
                    connection_id: member,
                    existing: existing.clone(),
                });
            }
        }
        if self.sessions.contains_key(&session.room_id) {
            return Err(RelayError::Conflict {
                connection_id: session.member_a,
                existing: session.room_id,
            });
        }

        let room_id = session.room_id.clone();
        for member in session.members() {
            self.by_member.insert(member, room_id.clone());
        }
        let session = self.sessions.entry(room_id).or_insert(session);
        Ok(&*session)
    }

    /// Resolve the connection a signal from `from` in `room_id` must go to.
    pub fn resolve(
        &self,
        room_id: &RoomId,
        from: ConnectionId,
    ) -> Result<ConnectionId, RelayError> {
        let session = self
            .sessions
            .get(room_id)
            .ok_or_else(|| RelayError::UnknownSession(room_id.clone()))?;
        session
            .peer_of(from)
            .ok_or_else(|| RelayError::UnauthorizedRelay {
                room_id: room_id.clone(),
                from,
            })
    }

    /// Tear down the session `id` belongs to, if any. Idempotent.
    pub fn handle_disconnect(&mut self, id: ConnectionId) -> Option<Session> {
        let room_id = self.by_member.remove(&id)?;
        let session = self.sessions.remove(&room_id)?;
        for member in session.members() {
            self.by_member.remove(&member);
        }
        Some(session)
    }

    pub fn session_of(&self, id: ConnectionId) -> Option<&Session> {
        self.by_member
            .get(&id)
            .and_then(|room_id| self.sessions.get(room_id))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
