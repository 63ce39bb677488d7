use dashmap::DashMap;
use std::collections::HashSet;

/// In-memory room membership index, both directions.
///
/// Loaded from the database at startup and kept in sync by the room
/// coordinator, so presence fan-out never has to query per room.
pub struct MemberIndex {
    rooms: DashMap<i64, HashSet<i64>>,
    users: DashMap<i64, HashSet<i64>>,
}

impl MemberIndex {
    pub fn empty() -> Self {
        MemberIndex {
            rooms: DashMap::new(),
            users: DashMap::new(),
        }
    }

    /// Build the index from `(room_id, user_id)` pairs.
    pub fn from_memberships(rows: Vec<(i64, i64)>) -> Self {
        let index = Self::empty();
        index.reload(rows);
        index
    }

    /// Replace the whole index.
    pub fn reload(&self, rows: Vec<(i64, i64)>) {
        self.rooms.clear();
        self.users.clear();
        for (room_id, user_id) in rows {
            self.add_member(room_id, user_id);
        }
        tracing::info!(rooms = self.rooms.len(), "member index loaded");
    }

    pub fn add_member(&self, room_id: i64, user_id: i64) {
        self.rooms.entry(room_id).or_default().insert(user_id);
        self.users.entry(user_id).or_default().insert(room_id);
    }

    pub fn remove_member(&self, room_id: i64, user_id: i64) {
        if let Some(mut members) = self.rooms.get_mut(&room_id) {
            members.remove(&user_id);
        }
        if let Some(mut rooms) = self.users.get_mut(&user_id) {
            rooms.remove(&room_id);
        }
    }

    pub fn remove_room(&self, room_id: i64) {
        if let Some((_, members)) = self.rooms.remove(&room_id) {
            for user_id in members {
                if let Some(mut rooms) = self.users.get_mut(&user_id) {
                    rooms.remove(&room_id);
                }
            }
        }
    }

    pub fn is_member(&self, room_id: i64, user_id: i64) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    pub fn members_of(&self, room_id: i64) -> Vec<i64> {
        let mut members: Vec<i64> = self
            .rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn rooms_of(&self, user_id: i64) -> Vec<i64> {
        let mut rooms: Vec<i64> = self
            .users
            .get(&user_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }

    /// Everyone sharing at least one room with `user_id`, excluding the user.
    pub fn presence_recipients(&self, user_id: i64) -> HashSet<i64> {
        let mut recipients = HashSet::new();
        for room_id in self.rooms_of(user_id) {
            if let Some(members) = self.rooms.get(&room_id) {
                recipients.extend(members.iter());
            }
        }
        recipients.remove(&user_id);
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_recipients_span_shared_rooms() {
        let index = MemberIndex::from_memberships(vec![(1, 10), (1, 11), (2, 10), (2, 12), (3, 13)]);
        let recipients = index.presence_recipients(10);
        assert_eq!(recipients, HashSet::from([11, 12]));
        assert!(index.presence_recipients(99).is_empty());
    }

    #[test]
    fn removing_a_room_updates_both_directions() {
        let index = MemberIndex::from_memberships(vec![(1, 10), (1, 11), (2, 10)]);
        index.remove_room(1);
        assert_eq!(index.rooms_of(10), vec![2]);
        assert!(index.rooms_of(11).is_empty());
        assert!(!index.is_member(1, 10));
    }

    #[test]
    fn member_changes_are_tracked() {
        let index = MemberIndex::empty();
        index.add_member(5, 1);
        index.add_member(5, 2);
        index.remove_member(5, 1);
        assert_eq!(index.members_of(5), vec![2]);
        assert_eq!(index.rooms_of(1), Vec::<i64>::new());
    }
}
