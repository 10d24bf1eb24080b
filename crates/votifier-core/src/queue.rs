//! Per-recipient waiting list for votes whose recipient is offline.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sink::DeliverySink;
use crate::vote::Vote;

/// What [`OfflineQueue::deliver_or_queue`] did with a vote.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Routing {
    /// Handed straight to the sink.
    Delivered,
    /// Parked until the recipient becomes available.
    Queued,
}

/// Mutex-guarded map of recipient to pending votes.
///
/// The lock is held only while the map is mutated; sink callbacks run after
/// it is released.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    waiting: Mutex<HashMap<String, Vec<Vote>>>,
}

impl OfflineQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<String, Vec<Vote>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `vote` to the recipient's list.
    pub fn enqueue(&self, recipient: &str, vote: Vote) {
        self.waiting()
            .entry(recipient.to_owned())
            .or_default()
            .push(vote);
    }

    /// Removes and returns every vote for `recipient`, in arrival order.
    pub fn take(&self, recipient: &str) -> Vec<Vote> {
        self.waiting().remove(recipient).unwrap_or_default()
    }

    /// Delivers every pending vote for `recipient` and returns how many.
    pub fn flush(&self, recipient: &str, sink: &dyn DeliverySink) -> usize {
        let votes = self.take(recipient);
        for vote in &votes {
            sink.on_vote_decoded(vote);
        }
        votes.len()
    }

    /// Discards every pending vote and returns how many were dropped.
    pub fn clear_all(&self) -> usize {
        let mut waiting = self.waiting();
        let dropped = waiting.values().map(Vec::len).sum();
        waiting.clear();
        dropped
    }

    /// True when at least one vote is pending.
    #[must_use]
    pub fn check_non_empty(&self) -> bool {
        !self.waiting().is_empty()
    }

    /// Number of votes pending for `recipient`.
    #[must_use]
    pub fn pending(&self, recipient: &str) -> usize {
        self.waiting().get(recipient).map_or(0, Vec::len)
    }

    /// Pending counts per recipient, sorted by name.
    #[must_use]
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .waiting()
            .iter()
            .map(|(name, votes)| (name.clone(), votes.len()))
            .collect();
        out.sort();
        out
    }

    /// Delivers `vote` now if its recipient is available, else queues it
    /// under the vote's username.
    pub fn deliver_or_queue(&self, vote: Vote, sink: &dyn DeliverySink) -> Routing {
        if sink.is_recipient_available(vote.username()) {
            sink.on_vote_decoded(&vote);
            return Routing::Delivered;
        }
        let recipient = vote.username().to_owned();
        self.enqueue(&recipient, vote);
        Routing::Queued
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<Vote>>,
        online: HashSet<String>,
    }

    impl DeliverySink for Recorder {
        fn on_vote_decoded(&self, vote: &Vote) {
            self.delivered.lock().expect("lock").push(vote.clone());
        }

        fn is_recipient_available(&self, recipient: &str) -> bool {
            self.online.contains(recipient)
        }
    }

    fn vote(service: &str, user: &str) -> Vote {
        Vote::new(service, user, "1.2.3.4", "1700000000").expect("vote")
    }

    #[test]
    fn flush_delivers_in_order_and_empties() {
        let queue = OfflineQueue::new();
        let sink = Recorder::default();
        queue.enqueue("Alice", vote("A", "Alice"));
        queue.enqueue("Alice", vote("B", "Alice"));
        queue.enqueue("Alice", vote("C", "Alice"));
        assert_eq!(queue.pending("Alice"), 3);

        assert_eq!(queue.flush("Alice", &sink), 3);
        let services: Vec<String> = sink
            .delivered
            .lock()
            .expect("lock")
            .iter()
            .map(|v| v.service_name().to_owned())
            .collect();
        assert_eq!(services, ["A", "B", "C"]);
        assert_eq!(queue.pending("Alice"), 0);
        assert!(!queue.check_non_empty());
    }

    #[test]
    fn clear_all_discards_without_delivering() {
        let queue = OfflineQueue::new();
        let sink = Recorder::default();
        for user in ["Alice", "Bob", "Carol"] {
            queue.enqueue(user, vote("TopList", user));
        }
        assert_eq!(queue.clear_all(), 3);
        assert!(!queue.check_non_empty());
        for user in ["Alice", "Bob", "Carol"] {
            assert_eq!(queue.flush(user, &sink), 0);
        }
        assert!(sink.delivered.lock().expect("lock").is_empty());
    }

    #[test]
    fn duplicates_are_kept() {
        let queue = OfflineQueue::new();
        queue.enqueue("Alice", vote("TopList", "Alice"));
        queue.enqueue("Alice", vote("TopList", "Alice"));
        assert_eq!(queue.summary(), [("Alice".to_owned(), 2)]);
    }

    #[test]
    fn routing_follows_availability() {
        let queue = OfflineQueue::new();
        let mut sink = Recorder::default();
        sink.online.insert("Alice".to_owned());
        assert_eq!(
            queue.deliver_or_queue(vote("TopList", "Alice"), &sink),
            Routing::Delivered
        );
        assert_eq!(
            queue.deliver_or_queue(vote("TopList", "Bob"), &sink),
            Routing::Queued
        );
        assert_eq!(queue.pending("Bob"), 1);
        assert_eq!(sink.delivered.lock().expect("lock").len(), 1);
    }
}
