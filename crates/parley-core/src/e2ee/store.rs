use dashmap::DashMap;
use std::collections::BTreeSet;

use super::session::{IdentityKeys, PairwiseSession};

/// Group bookkeeping: who is in the mesh.
#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    pub members: BTreeSet<i64>,
    pub generation: u64,
}

/// In-memory key and session storage.
///
/// Sessions are keyed by the ordered pair `(owner, peer)`: the state `owner`
/// uses to send to and receive from `peer`.
#[derive(Default)]
pub(crate) struct SessionStore {
    pub identities: DashMap<i64, IdentityKeys>,
    pub sessions: DashMap<(i64, i64), PairwiseSession>,
    pub groups: DashMap<i64, GroupState>,
}

impl SessionStore {
    /// Snapshot of a user's keys, without holding the map lock afterwards.
    pub fn identity(&self, user_id: i64) -> Option<IdentityKeys> {
        self.identities.get(&user_id).map(|keys| keys.clone())
    }

    pub fn has_session(&self, owner: i64, peer: i64) -> bool {
        self.sessions.contains_key(&(owner, peer))
    }

    pub fn forget_user(&self, user_id: i64) {
        self.identities.remove(&user_id);
        self.sessions
            .retain(|(owner, peer), _| *owner != user_id && *peer != user_id);
    }
}
