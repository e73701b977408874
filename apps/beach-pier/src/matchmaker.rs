//! FIFO waiting queue for clients looking for a partner.
//!
//! The matchmaker holds no lock of its own. Callers serialize access (see
//! [`crate::switchboard`]) so the pop, liveness check and push of a single
//! request form one atomic step.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::protocol::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiting {
    pub connection_id: ConnectionId,
    pub since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    /// Paired with `partner`, the earlier requester. The caller is the initiator.
    Paired { partner: ConnectionId },
    /// Nobody live was waiting; the requester now waits at the tail.
    Enqueued,
    /// The requester was already waiting. Nothing changed.
    AlreadyQueued,
    /// The requester was found at the head of the queue and moved to the tail.
    Requeued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchAttempt {
    pub decision: MatchDecision,
    /// Queue entries dropped because their connection was no longer live.
    pub discarded: Vec<ConnectionId>,
}

impl MatchAttempt {
    fn new(decision: MatchDecision, discarded: Vec<ConnectionId>) -> Self {
        Self {
            decision,
            discarded,
        }
    }
}

#[derive(Debug, Default)]
pub struct Matchmaker {
    queue: VecDeque<Waiting>,
    queued: HashSet<ConnectionId>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `id` with the oldest live waiter, or enqueue it.
    ///
    /// Stale heads (connections that went away after queueing) are discarded
    /// until a live partner turns up or the queue runs dry.
    pub fn request_match(
        &mut self,
        id: ConnectionId,
        now: Instant,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> MatchAttempt {
        if self.queued.contains(&id) {
            return MatchAttempt::new(MatchDecision::AlreadyQueued, Vec::new());
        }

        let mut discarded = Vec::new();
        while let Some(head) = self.queue.pop_front() {
            self.queued.remove(&head.connection_id);

            if head.connection_id == id {
                self.push(id, now);
                return MatchAttempt::new(MatchDecision::Requeued, discarded);
            }

            if !is_live(head.connection_id) {
                discarded.push(head.connection_id);
                continue;
            }

            return MatchAttempt::new(
                MatchDecision::Paired {
                    partner: head.connection_id,
                },
                discarded,
            );
        }

        self.push(id, now);
        MatchAttempt::new(MatchDecision::Enqueued, discarded)
    }

    /// Remove `id` from the queue. Unknown ids are ignored.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        if !self.queued.remove(&id) {
            return false;
        }
        self.queue.retain(|waiting| waiting.connection_id != id);
        true
    }

    /// Remove every entry that has been waiting since `cutoff` or earlier.
    pub fn evict_waiting_since(&mut self, cutoff: Instant) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();
        self.queue.retain(|waiting| {
            if waiting.since <= cutoff {
                evicted.push(waiting.connection_id);
                false
            } else {
                true
            }
        });
        for id in &evicted {
            self.queued.remove(id);
        }
        evicted
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.queued.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &Waiting> {
        self.queue.iter()
    }

    fn push(&mut self, id: ConnectionId, now: Instant) {
        self.queued.insert(id);
        self.queue.push_back(Waiting {
            connection_id: id,
            since: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn always_live(_: ConnectionId) -> bool {
        true
    }

    fn ids(n: usize) -> Vec<ConnectionId> {
        (0..n).map(|_| ConnectionId::generate()).collect()
    }

    #[test_timeout::timeout]
    fn pairs_in_strict_fifo_order() {
        let mut mm = Matchmaker::new();
        let clients = ids(6);
        let now = Instant::now();

        for pair in clients.chunks(2) {
            let first = mm.request_match(pair[0], now, always_live);
            assert_eq!(first.decision, MatchDecision::Enqueued);
            let second = mm.request_match(pair[1], now, always_live);
            assert_eq!(
                second.decision,
                MatchDecision::Paired { partner: pair[0] }
            );
            assert!(mm.is_empty());
        }
    }

    #[test_timeout::timeout]
    fn third_requester_waits_alone() {
        let mut mm = Matchmaker::new();
        let [x, y, z] = [
            ConnectionId::generate(),
            ConnectionId::generate(),
            ConnectionId::generate(),
        ];
        let now = Instant::now();

        mm.request_match(x, now, always_live);
        let paired = mm.request_match(y, now, always_live);
        assert_eq!(paired.decision, MatchDecision::Paired { partner: x });
        let queued = mm.request_match(z, now, always_live);
        assert_eq!(queued.decision, MatchDecision::Enqueued);
        assert_eq!(mm.len(), 1);
        assert!(mm.contains(z));
    }

    #[test_timeout::timeout]
    fn duplicate_request_is_ignored() {
        let mut mm = Matchmaker::new();
        let x = ConnectionId::generate();
        let now = Instant::now();
        mm.request_match(x, now, always_live);
        let again = mm.request_match(x, now, always_live);
        assert_eq!(again.decision, MatchDecision::AlreadyQueued);
        assert_eq!(mm.len(), 1);
    }

    #[test_timeout::timeout]
    fn disconnected_waiter_is_not_a_phantom_partner() {
        let mut mm = Matchmaker::new();
        let (x, y) = (ConnectionId::generate(), ConnectionId::generate());
        let now = Instant::now();
        mm.request_match(x, now, always_live);
        assert!(mm.disconnect(x));
        assert!(!mm.disconnect(x));

        let attempt = mm.request_match(y, now, always_live);
        assert_eq!(attempt.decision, MatchDecision::Enqueued);
        assert!(attempt.discarded.is_empty());
        assert_eq!(mm.waiting().map(|w| w.connection_id).collect::<Vec<_>>(), vec![y]);
    }

    #[test_timeout::timeout]
    fn stale_heads_are_discarded_until_a_live_partner() {
        let mut mm = Matchmaker::new();
        let clients = ids(4);
        let now = Instant::now();
        for id in &clients[..3] {
            mm.queue.push_back(Waiting {
                connection_id: *id,
                since: now,
            });
            mm.queued.insert(*id);
        }
        let dead: HashSet<_> = clients[..2].iter().copied().collect();

        let attempt = mm.request_match(clients[3], now, |id| !dead.contains(&id));
        assert_eq!(
            attempt.decision,
            MatchDecision::Paired {
                partner: clients[2]
            }
        );
        assert_eq!(attempt.discarded, clients[..2].to_vec());
        assert!(mm.is_empty());
    }

    #[test_timeout::timeout]
    fn only_stale_waiters_means_requester_is_enqueued() {
        let mut mm = Matchmaker::new();
        let (x, y) = (ConnectionId::generate(), ConnectionId::generate());
        let now = Instant::now();
        mm.request_match(x, now, always_live);

        let attempt = mm.request_match(y, now, |id| id != x);
        assert_eq!(attempt.decision, MatchDecision::Enqueued);
        assert_eq!(attempt.discarded, vec![x]);
        assert!(!mm.contains(x));
        assert!(mm.contains(y));
    }

    #[test_timeout::timeout]
    fn requester_at_head_is_requeued_at_tail() {
        let mut mm = Matchmaker::new();
        let (x, y) = (ConnectionId::generate(), ConnectionId::generate());
        let now = Instant::now();
        // Desynchronise the index from the queue to reach the guard.
        for id in [x, y] {
            mm.queue.push_back(Waiting {
                connection_id: id,
                since: now,
            });
        }
        mm.queued.insert(y);

        let attempt = mm.request_match(x, now, always_live);
        assert_eq!(attempt.decision, MatchDecision::Requeued);
        assert_eq!(
            mm.waiting().map(|w| w.connection_id).collect::<Vec<_>>(),
            vec![y, x]
        );
    }

    #[test_timeout::timeout]
    fn evicts_only_entries_older_than_cutoff() {
        let mut mm = Matchmaker::new();
        let (old, fresh) = (ConnectionId::generate(), ConnectionId::generate());
        let start = Instant::now();
        mm.request_match(old, start, always_live);
        mm.queued.insert(fresh);
        mm.queue.push_back(Waiting {
            connection_id: fresh,
            since: start + Duration::from_secs(10),
        });

        let evicted = mm.evict_waiting_since(start + Duration::from_secs(5));
        assert_eq!(evicted, vec![old]);
        assert!(!mm.contains(old));
        assert!(mm.contains(fresh));
        assert_eq!(mm.len(), 1);
    }
}
