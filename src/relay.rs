// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Named-group fan-out of opaque text messages, used by peers to exchange
//! session signaling. Nothing here looks inside the messages.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use tokio::sync::mpsc;

pub struct RelayRegistry {
    next_member_id: AtomicU64,

    // Outbound queue capacity per member.
    member_capacity: usize,

    // Group name -> member id -> member's outbound queue. Groups with no
    // members are removed.
    groups: Mutex<HashMap<String, HashMap<u64, mpsc::Sender<String>>>>,
}

/// One connection's membership. Messages from other members of the group
/// arrive on `receiver`.
pub struct RelayMember {
    pub group: String,
    pub id: u64,
    pub receiver: mpsc::Receiver<String>,
}

impl RelayRegistry {
    pub fn new(member_capacity: usize) -> Self {
        RelayRegistry{
            next_member_id: AtomicU64::new(1),
            member_capacity: member_capacity.max(1),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn join(&self, group: &str) -> RelayMember {
        let id = self.next_member_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.member_capacity);
        self.lock().entry(group.to_string()).or_default().insert(id, sender);
        debug!("Relay member {} joined group {}", id, group);
        RelayMember{group: group.to_string(), id, receiver}
    }

    pub fn leave(&self, group: &str, id: u64) {
        let mut groups = self.lock();
        if let Some(members) = groups.get_mut(group) {
            members.remove(&id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        debug!("Relay member {} left group {}", id, group);
    }

    /// Forwards `message` to every member of `group` except `from`. Returns
    /// how many members it was queued for; members whose queue is full or
    /// closed are skipped.
    pub fn broadcast(&self, group: &str, from: u64, message: &str) -> usize {
        let groups = self.lock();
        let members = match groups.get(group) {
            Some(members) => members,
            None => return 0,
        };
        members.iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, sender)| sender.try_send(message.to_string()).is_ok())
            .count()
    }

    pub fn group_count(&self) -> usize {
        self.lock().len()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.lock().get(group).map(|m| m.len()).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, mpsc::Sender<String>>>> {
        match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_excludes_sender() {
        let relay = RelayRegistry::new(8);
        let mut a = relay.join("room");
        let mut b = relay.join("room");
        let mut c = relay.join("room");
        let mut other = relay.join("elsewhere");

        assert_eq!(relay.broadcast("room", a.id, "offer"), 2);
        assert!(a.receiver.try_recv().is_err());
        assert_eq!(b.receiver.try_recv().unwrap(), "offer");
        assert_eq!(c.receiver.try_recv().unwrap(), "offer");
        assert!(other.receiver.try_recv().is_err());
    }

    #[test]
    fn test_empty_group_removed() {
        let relay = RelayRegistry::new(8);
        let a = relay.join("room");
        let b = relay.join("room");
        assert_eq!(relay.group_count(), 1);
        assert_eq!(relay.member_count("room"), 2);
        relay.leave("room", a.id);
        assert_eq!(relay.member_count("room"), 1);
        relay.leave("room", b.id);
        assert_eq!(relay.group_count(), 0);
        // Leaving twice, or an unknown group, is harmless.
        relay.leave("room", b.id);
        relay.leave("nowhere", 99);
        assert_eq!(relay.broadcast("room", a.id, "late"), 0);
    }

    #[test]
    fn test_saturated_member_skipped() {
        let relay = RelayRegistry::new(1);
        let a = relay.join("room");
        let mut b = relay.join("room");
        assert_eq!(relay.broadcast("room", a.id, "one"), 1);
        assert_eq!(relay.broadcast("room", a.id, "two"), 0);
        assert_eq!(b.receiver.try_recv().unwrap(), "one");
        assert!(b.receiver.try_recv().is_err());

        drop(b);
        assert_eq!(relay.broadcast("room", a.id, "three"), 0);
    }

}  // mod tests.
