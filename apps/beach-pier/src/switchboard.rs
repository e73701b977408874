//! Serialized access to the matchmaking queue and the session table.
//!
//! One mutex guards both structures, so every request, relay lookup and
//! disconnect observes them in a consistent state. The lock is never held
//! across an await point or while handing messages to connection writers;
//! notifications are computed under the lock and delivered after it drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::matchmaker::{MatchDecision, Matchmaker};
use crate::protocol::{ConnectionId, Envelope, RoomId, ServerMessage};
use crate::registry::{Delivery, Directory};
use crate::relay::{RelayError, Session, SessionRelay};

#[derive(Debug, Clone, Default)]
pub struct SwitchboardConfig {
    /// Tell the surviving member when its peer disconnects.
    pub notify_peer_left: bool,
    /// Evict clients that have waited this long without a partner.
    pub queue_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A session was created; both members have been notified.
    Matched(Session),
    /// The requester is waiting for a partner.
    Queued,
    /// The request violated a precondition and changed nothing.
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotLive,
    AlreadyQueued,
    AlreadyMatched(RoomId),
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departure {
    pub was_queued: bool,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub waiting: Vec<ConnectionId>,
    pub sessions: Vec<Session>,
}

#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<SwitchboardInner>,
}

struct SwitchboardInner {
    directory: Arc<dyn Directory>,
    board: Mutex<Board>,
    config: SwitchboardConfig,
}

#[derive(Default)]
struct Board {
    matchmaker: Matchmaker,
    relay: SessionRelay,
}

impl Board {
    fn publish_gauges(&self) {
        gauge!("beach_pier_queue_length", self.matchmaker.len() as f64);
        gauge!("beach_pier_active_sessions", self.relay.len() as f64);
    }
}

impl Switchboard {
    pub fn new(directory: Arc<dyn Directory>, config: SwitchboardConfig) -> Self {
        Self {
            inner: Arc::new(SwitchboardInner {
                directory,
                board: Mutex::new(Board::default()),
                config,
            }),
        }
    }

    /// Greet a freshly registered connection with its own id.
    pub fn connect(&self, id: ConnectionId) -> Delivery {
        self.inner
            .directory
            .deliver(id, ServerMessage::Welcome { connection_id: id })
    }

    pub fn request_match(&self, id: ConnectionId) -> MatchOutcome {
        let directory = &self.inner.directory;
        let outcome = {
            let mut board = self.inner.board.lock();
            let outcome = Self::request_match_locked(&mut board, directory.as_ref(), id);
            board.publish_gauges();
            outcome
        };

        match &outcome {
            MatchOutcome::Matched(session) => {
                info!(
                    room_id = %session.room_id,
                    member_a = %session.member_a,
                    member_b = %session.member_b,
                    initiator = %session.initiator,
                    "match found"
                );
                counter!("beach_pier_matches_total", 1);
                for member in session.members() {
                    let delivery = directory.deliver(
                        member,
                        ServerMessage::MatchFound {
                            room_id: session.room_id.clone(),
                            initiator: session.initiator,
                        },
                    );
                    if !delivery.is_delivered() {
                        warn!(
                            connection_id = %member,
                            room_id = %session.room_id,
                            ?delivery,
                            "match notification not delivered"
                        );
                    }
                }
            }
            MatchOutcome::Queued => debug!(connection_id = %id, "waiting for a partner"),
            MatchOutcome::Ignored(reason) => {
                debug!(connection_id = %id, ?reason, "match request ignored")
            }
        }

        outcome
    }

    fn request_match_locked(
        board: &mut Board,
        directory: &dyn Directory,
        id: ConnectionId,
    ) -> MatchOutcome {
        if !directory.is_live(id) {
            return MatchOutcome::Ignored(IgnoreReason::NotLive);
        }
        if let Some(session) = board.relay.session_of(id) {
            return MatchOutcome::Ignored(IgnoreReason::AlreadyMatched(session.room_id.clone()));
        }

        let attempt = board
            .matchmaker
            .request_match(id, Instant::now(), |candidate| {
                directory.is_live(candidate)
            });
        for stale in &attempt.discarded {
            debug!(connection_id = %stale, "discarding stale queue entry");
            counter!("beach_pier_stale_partners_total", 1);
        }

        match attempt.decision {
            MatchDecision::Paired { partner } => {
                match board.relay.register(Session::pair(partner, id)) {
                    Ok(session) => MatchOutcome::Matched(session.clone()),
                    Err(err) => {
                        error!(error = %err, "session registration failed");
                        counter!("beach_pier_session_conflicts_total", 1);
                        MatchOutcome::Ignored(IgnoreReason::Conflict)
                    }
                }
            }
            MatchDecision::Enqueued | MatchDecision::Requeued => MatchOutcome::Queued,
            MatchDecision::AlreadyQueued => MatchOutcome::Ignored(IgnoreReason::AlreadyQueued),
        }
    }

    /// Forward `envelope` from `from` to the other member of `room_id`.
    ///
    /// Errors mean the envelope was dropped. They are for the caller's logs
    /// only and are never reported back to the sender.
    pub fn route(
        &self,
        room_id: &RoomId,
        from: ConnectionId,
        envelope: Envelope,
    ) -> Result<Delivery, RelayError> {
        let target = self.inner.board.lock().relay.resolve(room_id, from);
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                debug!(
                    room_id = %room_id,
                    connection_id = %from,
                    kind = %envelope.kind,
                    error = %err,
                    "dropping envelope"
                );
                counter!("beach_pier_envelopes_dropped_total", 1, "reason" => err.reason());
                return Err(err);
            }
        };

        let bytes = envelope.payload().len();
        let kind = envelope.kind;
        let delivery = self.inner.directory.deliver(
            target,
            ServerMessage::Signal {
                room_id: room_id.clone(),
                from,
                envelope,
            },
        );
        if delivery.is_delivered() {
            counter!("beach_pier_envelopes_relayed_total", 1, "kind" => kind.as_str());
            counter!("beach_pier_envelope_bytes_total", bytes as u64);
        } else {
            debug!(room_id = %room_id, target = %target, ?delivery, "peer unreachable");
            counter!("beach_pier_envelopes_dropped_total", 1, "reason" => "peer_unreachable");
        }
        Ok(delivery)
    }

    /// Forget `id` everywhere. Safe to call repeatedly and for unknown ids.
    pub fn disconnect(&self, id: ConnectionId) -> Departure {
        let departure = {
            let mut board = self.inner.board.lock();
            let departure = Departure {
                was_queued: board.matchmaker.disconnect(id),
                session: board.relay.handle_disconnect(id),
            };
            board.publish_gauges();
            departure
        };

        if let Some(session) = &departure.session {
            info!(
                room_id = %session.room_id,
                connection_id = %id,
                "session dissolved"
            );
            if self.inner.config.notify_peer_left {
                if let Some(peer) = session.peer_of(id) {
                    self.inner.directory.deliver(
                        peer,
                        ServerMessage::PeerLeft {
                            room_id: session.room_id.clone(),
                        },
                    );
                }
            }
        }

        departure
    }

    /// Evict queue entries older than the configured residency timeout.
    pub fn evict_stale(&self, now: Instant) -> Vec<ConnectionId> {
        let Some(timeout) = self.inner.config.queue_timeout else {
            return Vec::new();
        };
        let Some(cutoff) = now.checked_sub(timeout) else {
            return Vec::new();
        };

        let evicted = {
            let mut board = self.inner.board.lock();
            let evicted = board.matchmaker.evict_waiting_since(cutoff);
            board.publish_gauges();
            evicted
        };

        for id in &evicted {
            info!(connection_id = %id, "queue residency timeout");
            counter!("beach_pier_queue_timeouts_total", 1);
            self.inner.directory.deliver(*id, ServerMessage::QueueTimeout);
        }
        evicted
    }

    /// Periodically evict stale waiters. Returns `None` when no residency
    /// timeout is configured.
    pub fn spawn_reaper(&self, interval: Duration) -> Option<JoinHandle<()>> {
        self.inner.config.queue_timeout?;
        let switchboard = self.clone();
        let mut ticker = tokio::time::interval(interval);
        Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let _ = switchboard.evict_stale(Instant::now());
            }
        }))
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let board = self.inner.board.lock();
        let mut sessions: Vec<Session> = board.relay.sessions().cloned().collect();
        sessions.sort_by_key(|session| session.created_at);
        BoardSnapshot {
            waiting: board
                .matchmaker
                .waiting()
                .map(|waiting| waiting.connection_id)
                .collect(),
            sessions,
        }
    }
}
