//! Named dispatch groups for waking workers.
//!
//! Producers broadcast a pull wake-up into a group after a successful push;
//! idle workers react, busy workers drop the signal. Delivery is best-effort:
//! the 1 s idle poll in each worker is the recovery path for a missed
//! wake-up.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered wake-ups per group; signals carry no data and coalesce, so a
/// small buffer is enough.
const CHANNEL_CAPACITY: usize = 16;

/// A wake-up delivered to every member of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A message was pushed; idle workers should pull.
    PullJob,
}

/// Registry of named worker groups.
#[derive(Default)]
pub struct Dispatch {
    groups: RwLock<HashMap<String, broadcast::Sender<Signal>>>,
}

impl Dispatch {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a group, creating it on first use, and returns the member's
    /// receive handle.
    pub fn join(&self, group: &str) -> broadcast::Receiver<Signal> {
        let mut groups = self.groups.write();
        let sender = groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let receiver = sender.subscribe();
        debug!(
            group = %group,
            members = sender.receiver_count(),
            "joined dispatch group"
        );
        receiver
    }

    /// Broadcasts a signal to every member of `group`, non-blocking.
    /// Returns the number of members that were reachable; an unknown or
    /// empty group is a no-op.
    pub fn broadcast(&self, group: &str, signal: Signal) -> usize {
        let groups = self.groups.read();
        match groups.get(group) {
            Some(sender) => sender.send(signal).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of live members in `group`.
    pub fn group_size(&self, group: &str) -> usize {
        self.groups
            .read()
            .get(group)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let dispatch = Dispatch::new();
        let mut first = dispatch.join("workers");
        let mut second = dispatch.join("workers");

        assert_eq!(dispatch.broadcast("workers", Signal::PullJob), 2);
        assert_eq!(first.recv().await.unwrap(), Signal::PullJob);
        assert_eq!(second.recv().await.unwrap(), Signal::PullJob);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_group_is_noop() {
        let dispatch = Dispatch::new();
        assert_eq!(dispatch.broadcast("nobody", Signal::PullJob), 0);
    }

    #[tokio::test]
    async fn test_broadcast_after_all_members_left() {
        let dispatch = Dispatch::new();
        let receiver = dispatch.join("workers");
        drop(receiver);

        assert_eq!(dispatch.broadcast("workers", Signal::PullJob), 0);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let dispatch = Dispatch::new();
        let mut a = dispatch.join("a");
        let _b = dispatch.join("b");

        dispatch.broadcast("b", Signal::PullJob);
        assert!(a.try_recv().is_err());

        dispatch.broadcast("a", Signal::PullJob);
        assert_eq!(a.recv().await.unwrap(), Signal::PullJob);
    }

    #[test]
    fn test_group_size() {
        let dispatch = Dispatch::new();
        assert_eq!(dispatch.group_size("workers"), 0);

        let first = dispatch.join("workers");
        let second = dispatch.join("workers");
        assert_eq!(dispatch.group_size("workers"), 2);

        drop(first);
        drop(second);
        assert_eq!(dispatch.group_size("workers"), 0);
    }
}
