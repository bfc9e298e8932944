// Per-connection presence (name, color, awareness payload) for one room.
// Owned by the room actor; nothing here is ever written to the snapshot store.

use std::collections::HashMap;

use scenesync_common::protocol::ws::PeerPresence;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct PresenceTable {
    peers: HashMap<Uuid, PeerPresence>,
}

impl PresenceTable {
    pub fn insert(&mut self, peer: PeerPresence) {
        self.peers.insert(peer.connection_id, peer);
    }

    /// Replaces the awareness payload and returns the updated record.
    pub fn update_state(&mut self, connection_id: Uuid, state: Value) -> Option<PeerPresence> {
        let peer = self.peers.get_mut(&connection_id)?;
        peer.state = state;
        Some(peer.clone())
    }

    pub fn remove(&mut self, connection_id: Uuid) -> Option<PeerPresence> {
        self.peers.remove(&connection_id)
    }

    /// All peers, ordered by user then connection so snapshots are stable.
    pub fn snapshot(&self) -> Vec<PeerPresence> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|left, right| {
            left.user_id.cmp(&right.user_id).then_with(|| left.connection_id.cmp(&right.connection_id))
        });
        peers
    }

    pub fn distinct_users(&self) -> usize {
        let mut users: Vec<&str> = self.peers.values().map(|peer| peer.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        users.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(user_id: &str) -> PeerPresence {
        PeerPresence {
            connection_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: None,
            color: None,
            state: Value::Null,
        }
    }

    #[test]
    fn update_and_remove_track_connections() {
        let mut table = PresenceTable::default();
        let ada = peer("ada");
        let ada_id = ada.connection_id;
        table.insert(ada);
        table.insert(peer("bob"));

        let updated = table
            .update_state(ada_id, serde_json::json!({ "cursor": { "x": 3 } }))
            .expect("peer exists");
        assert_eq!(updated.state["cursor"]["x"], 3);
        assert!(table.update_state(Uuid::new_v4(), Value::Null).is_none());

        assert!(table.remove(ada_id).is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].user_id, "bob");
    }

    #[test]
    fn same_user_in_two_tabs_counts_once() {
        let mut table = PresenceTable::default();
        table.insert(peer("ada"));
        table.insert(peer("ada"));
        table.insert(peer("bob"));
        assert_eq!(table.len(), 3);
        assert_eq!(table.distinct_users(), 2);
    }
}
