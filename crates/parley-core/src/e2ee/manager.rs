use chrono::Utc;
use std::collections::BTreeSet;

use super::session::{agree, Envelope, IdentityKeys, PreKeyBundle};
use super::store::{GroupState, SessionStore};
use super::CryptoError;

pub const DEFAULT_PREKEY_BATCH: usize = 20;

/// Owns every identity, pairwise session and group mesh.
pub struct EncryptionManager {
    store: SessionStore,
    prekey_batch: usize,
}

impl EncryptionManager {
    pub fn new(prekey_batch: usize) -> Self {
        Self {
            store: SessionStore::default(),
            prekey_batch,
        }
    }

    /// Create the user's identity if needed and return its public bundle.
    ///
    /// Calling again returns the existing identity; no one-time prekey is handed out.
    pub fn setup_user(&self, user_id: i64) -> PreKeyBundle {
        let entry = self
            .store
            .identities
            .entry(user_id)
            .or_insert_with(|| IdentityKeys::generate(self.prekey_batch));
        entry.bundle(user_id, None)
    }

    pub fn has_identity(&self, user_id: i64) -> bool {
        self.store.identities.contains_key(&user_id)
    }

    pub fn remaining_prekeys(&self, user_id: i64) -> Option<usize> {
        self.store.identities.get(&user_id).map(|keys| keys.remaining_prekeys())
    }

    /// A bundle for someone about to start a session with `user_id`. Consumes a one-time prekey.
    pub fn prekey_bundle(&self, user_id: i64) -> Result<PreKeyBundle, CryptoError> {
        let mut keys = self
            .store
            .identities
            .get_mut(&user_id)
            .ok_or(CryptoError::IdentityMissing(user_id))?;
        let one_time = keys.take_one_time();
        Ok(keys.bundle(user_id, one_time.as_ref().map(|(id, key)| (*id, key))))
    }

    /// Build (or rebuild) the sessions between `initiator` and `responder`, both directions.
    pub fn establish_session(&self, initiator: i64, responder: i64) -> Result<(), CryptoError> {
        if initiator == responder {
            return Err(CryptoError::InvalidEnvelope("cannot open a session with yourself".into()));
        }
        let initiator_keys = self
            .store
            .identity(initiator)
            .ok_or(CryptoError::IdentityMissing(initiator))?;
        let (responder_keys, one_time) = {
            let mut keys = self
                .store
                .identities
                .get_mut(&responder)
                .ok_or(CryptoError::IdentityMissing(responder))?;
            let one_time = keys.take_one_time().map(|(_, key)| key);
            (keys.clone(), one_time)
        };

        let (outbound, inbound) = agree(&initiator_keys, &responder_keys, one_time, Utc::now())?;
        self.store.sessions.insert((initiator, responder), outbound);
        self.store.sessions.insert((responder, initiator), inbound);
        tracing::debug!(initiator, responder, "pairwise session established");
        Ok(())
    }

    pub fn has_session(&self, owner: i64, peer: i64) -> bool {
        self.store.has_session(owner, peer)
    }

    pub fn encrypt(&self, sender_id: i64, recipient_id: i64, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let mut session = self
            .store
            .sessions
            .get_mut(&(sender_id, recipient_id))
            .ok_or(CryptoError::SessionNotFound { from: sender_id, to: recipient_id })?;
        session.seal(sender_id, recipient_id, plaintext)
    }

    /// Open an envelope addressed to `recipient_id` with the recipient's own session state.
    pub fn decrypt(&self, recipient_id: i64, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.recipient_id != recipient_id {
            return Err(CryptoError::InvalidEnvelope("envelope addressed to another user".into()));
        }
        let mut session = self
            .store
            .sessions
            .get_mut(&(recipient_id, envelope.sender_id))
            .ok_or(CryptoError::SessionNotFound { from: envelope.sender_id, to: recipient_id })?;
        let (plaintext, next) = session.open(envelope)?;
        *session = next;
        Ok(plaintext)
    }

    /// Create or replace a group: every member pair gets a fresh session.
    pub fn establish_group(&self, group_id: i64, members: &[i64]) -> Result<(), CryptoError> {
        let members: BTreeSet<i64> = members.iter().copied().collect();
        if let Some(missing) = members.iter().find(|id| !self.has_identity(**id)) {
            return Err(CryptoError::IdentityMissing(*missing));
        }
        let ordered: Vec<i64> = members.iter().copied().collect();
        for (i, a) in ordered.iter().enumerate() {
            for b in &ordered[i + 1..] {
                self.establish_session(*a, *b)?;
            }
        }
        let generation = self
            .store
            .groups
            .get(&group_id)
            .map_or(0, |group| group.generation + 1);
        tracing::info!(group_id, members = ordered.len(), generation, "group mesh built");
        self.store.groups.insert(group_id, GroupState { members, generation });
        Ok(())
    }

    /// Membership changed: rebuild the whole mesh.
    pub fn update_group_members(&self, group_id: i64, members: &[i64]) -> Result<(), CryptoError> {
        self.establish_group(group_id, members)
    }

    pub fn drop_group(&self, group_id: i64) -> bool {
        self.store.groups.remove(&group_id).is_some()
    }

    pub fn group_members(&self, group_id: i64) -> Option<Vec<i64>> {
        self.store
            .groups
            .get(&group_id)
            .map(|group| group.members.iter().copied().collect())
    }

    pub fn group_generation(&self, group_id: i64) -> Option<u64> {
        self.store.groups.get(&group_id).map(|group| group.generation)
    }

    /// One envelope per other member. Fails if any pairwise session is missing.
    pub fn encrypt_group(&self, group_id: i64, sender_id: i64, plaintext: &[u8]) -> Result<Vec<Envelope>, CryptoError> {
        let members = self
            .store
            .groups
            .get(&group_id)
            .map(|group| group.members.clone())
            .ok_or(CryptoError::GroupNotFound(group_id))?;
        if !members.contains(&sender_id) {
            return Err(CryptoError::NotGroupMember { group: group_id, user: sender_id });
        }
        let recipients: Vec<i64> = members.into_iter().filter(|id| *id != sender_id).collect();
        if let Some(to) = recipients.iter().find(|to| !self.has_session(sender_id, **to)) {
            return Err(CryptoError::GroupSessionInvalid { group: group_id, from: sender_id, to: *to });
        }
        recipients
            .into_iter()
            .map(|to| self.encrypt(sender_id, to, plaintext))
            .collect()
    }

    pub fn forget_user(&self, user_id: i64) {
        self.store.forget_user(user_id);
    }
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_PREKEY_BATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(users: &[i64]) -> EncryptionManager {
        let manager = EncryptionManager::new(4);
        for user in users {
            manager.setup_user(*user);
        }
        manager
    }

    #[test]
    fn pairwise_round_trip() {
        let manager = manager_with(&[1, 2]);
        manager.establish_session(1, 2).unwrap();

        let envelope = manager.encrypt(1, 2, b"hi bob").unwrap();
        assert_eq!(manager.decrypt(2, &envelope).unwrap(), b"hi bob");

        let reply = manager.encrypt(2, 1, b"hi alice").unwrap();
        assert_eq!(manager.decrypt(1, &reply).unwrap(), b"hi alice");
    }

    #[test]
    fn decrypt_without_session_is_session_not_found() {
        let manager = manager_with(&[1, 2, 3]);
        manager.establish_session(1, 2).unwrap();
        let envelope = manager.encrypt(1, 2, b"x").unwrap();
        let forged = Envelope { recipient_id: 3, ..envelope };
        assert!(matches!(
            manager.decrypt(3, &forged),
            Err(CryptoError::SessionNotFound { from: 1, to: 3 })
        ));
    }

    #[test]
    fn setup_is_idempotent_and_bundles_consume_prekeys() {
        let manager = manager_with(&[1]);
        let first = manager.setup_user(1);
        let second = manager.setup_user(1);
        assert_eq!(first.identity_key, second.identity_key);
        assert_eq!(manager.remaining_prekeys(1), Some(4));

        let bundle = manager.prekey_bundle(1).unwrap();
        assert_eq!(bundle.one_time_prekey_id, Some(1));
        assert_eq!(manager.remaining_prekeys(1), Some(3));
        assert!(matches!(manager.prekey_bundle(9), Err(CryptoError::IdentityMissing(9))));
    }

    #[test]
    fn three_member_group_yields_two_ciphertexts() {
        let manager = manager_with(&[1, 2, 3]);
        manager.establish_group(50, &[1, 2, 3]).unwrap();

        let envelopes = manager.encrypt_group(50, 1, b"team update").unwrap();
        assert_eq!(envelopes.len(), 2);
        for envelope in &envelopes {
            assert_eq!(
                manager.decrypt(envelope.recipient_id, envelope).unwrap(),
                b"team update"
            );
        }
        // Bob's envelope is useless to Carol.
        let for_bob = envelopes.iter().find(|e| e.recipient_id == 2).unwrap();
        assert!(manager.decrypt(3, for_bob).is_err());
    }

    #[test]
    fn membership_change_rebuilds_mesh() {
        let manager = manager_with(&[1, 2, 3, 4]);
        manager.establish_group(7, &[1, 2]).unwrap();
        manager.update_group_members(7, &[1, 2, 4]).unwrap();

        assert_eq!(manager.group_members(7), Some(vec![1, 2, 4]));
        assert_eq!(manager.group_generation(7), Some(1));
        assert_eq!(manager.encrypt_group(7, 4, b"joined").unwrap().len(), 2);
        assert!(matches!(
            manager.encrypt_group(7, 3, b"x"),
            Err(CryptoError::NotGroupMember { .. })
        ));
    }

    #[test]
    fn group_send_fails_when_a_session_is_missing() {
        let manager = manager_with(&[1, 2, 3]);
        manager.establish_group(8, &[1, 2, 3]).unwrap();
        manager.forget_user(3);
        manager.setup_user(3);
        assert!(matches!(
            manager.encrypt_group(8, 1, b"x"),
            Err(CryptoError::GroupSessionInvalid { to: 3, .. })
        ));
    }

    #[test]
    fn group_requires_identities() {
        let manager = manager_with(&[1]);
        assert!(matches!(
            manager.establish_group(9, &[1, 2]),
            Err(CryptoError::IdentityMissing(2))
        ));
        assert!(matches!(manager.encrypt_group(9, 1, b"x"), Err(CryptoError::GroupNotFound(9))));
    }
}
