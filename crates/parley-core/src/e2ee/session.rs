use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey, StaticSecret};

use super::CryptoError;

const X3DH_INFO: &[u8] = b"parley-x3dh-v1";
const CHAIN_INFO: &[u8] = b"parley-chain-v1";
const MESSAGE_INFO: &[u8] = b"parley-message-v1";
const NONCE_LEN: usize = 12;
/// Upper bound on message keys kept for out-of-order delivery.
const MAX_SKIP: u32 = 1000;
/// Skipped keys kept per session; the oldest go first.
const MAX_SKIPPED_KEYS: usize = 2 * MAX_SKIP as usize;

/// Private key material for one user.
#[derive(Clone)]
pub(crate) struct IdentityKeys {
    pub registration_id: u32,
    identity: StaticSecret,
    signing: SigningKey,
    signed_prekey_id: u32,
    signed_prekey: StaticSecret,
    signed_prekey_signature: Signature,
    one_time: BTreeMap<u32, StaticSecret>,
}

/// Public half of a user's keys, as handed to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    #[serde(with = "parley_models::id_str")]
    pub user_id: i64,
    pub registration_id: u32,
    pub identity_key: String,
    pub signing_key: String,
    pub signed_prekey_id: u32,
    pub signed_prekey: String,
    pub signed_prekey_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<String>,
}

impl IdentityKeys {
    pub fn generate(prekeys: usize) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let signed_prekey = StaticSecret::random_from_rng(OsRng);
        let signed_prekey_signature = signing.sign(PublicKey::from(&signed_prekey).as_bytes());
        let one_time = (1..=prekeys as u32)
            .map(|id| (id, StaticSecret::random_from_rng(OsRng)))
            .collect();
        Self {
            registration_id: OsRng.next_u32() & 0x3fff,
            identity: StaticSecret::random_from_rng(OsRng),
            signing,
            signed_prekey_id: 1,
            signed_prekey,
            signed_prekey_signature,
            one_time,
        }
    }

    pub fn identity_public(&self) -> PublicKey {
        PublicKey::from(&self.identity)
    }

    pub fn remaining_prekeys(&self) -> usize {
        self.one_time.len()
    }

    /// Public bundle. `one_time` is the prekey handed out with it, if any.
    pub fn bundle(&self, user_id: i64, one_time: Option<(u32, &StaticSecret)>) -> PreKeyBundle {
        PreKeyBundle {
            user_id,
            registration_id: self.registration_id,
            identity_key: BASE64.encode(self.identity_public().as_bytes()),
            signing_key: BASE64.encode(self.signing.verifying_key().as_bytes()),
            signed_prekey_id: self.signed_prekey_id,
            signed_prekey: BASE64.encode(PublicKey::from(&self.signed_prekey).as_bytes()),
            signed_prekey_signature: BASE64.encode(self.signed_prekey_signature.to_bytes()),
            one_time_prekey_id: one_time.map(|(id, _)| id),
            one_time_prekey: one_time.map(|(_, key)| BASE64.encode(PublicKey::from(key).as_bytes())),
        }
    }

    /// Remove and return the lowest-numbered one-time prekey.
    pub fn take_one_time(&mut self) -> Option<(u32, StaticSecret)> {
        self.one_time.pop_first()
    }

    fn verify_signed_prekey(&self) -> Result<(), CryptoError> {
        let verifying: VerifyingKey = self.signing.verifying_key();
        verifying
            .verify(
                PublicKey::from(&self.signed_prekey).as_bytes(),
                &self.signed_prekey_signature,
            )
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Directional state one user holds for talking to one peer.
#[derive(Clone)]
pub(crate) struct PairwiseSession {
    send_chain: [u8; 32],
    send_counter: u32,
    recv_chain: [u8; 32],
    recv_counter: u32,
    skipped: BTreeMap<u32, [u8; 32]>,
    pub established_at: DateTime<Utc>,
}

/// Run the agreement between `initiator` and `responder` and return each side's session.
///
/// Both sides derive their root independently from their own private keys;
/// a mismatch means the key material is corrupt.
pub(crate) fn agree(
    initiator: &IdentityKeys,
    responder: &IdentityKeys,
    one_time: Option<StaticSecret>,
    now: DateTime<Utc>,
) -> Result<(PairwiseSession, PairwiseSession), CryptoError> {
    responder.verify_signed_prekey()?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let responder_identity = responder.identity_public();
    let responder_prekey = PublicKey::from(&responder.signed_prekey);
    let initiator_identity = initiator.identity_public();

    let mut initiator_secret = Vec::with_capacity(128);
    initiator_secret.extend_from_slice(initiator.identity.diffie_hellman(&responder_prekey).as_bytes());
    initiator_secret.extend_from_slice(ephemeral.diffie_hellman(&responder_identity).as_bytes());
    initiator_secret.extend_from_slice(ephemeral.diffie_hellman(&responder_prekey).as_bytes());

    let mut responder_secret = Vec::with_capacity(128);
    responder_secret.extend_from_slice(responder.signed_prekey.diffie_hellman(&initiator_identity).as_bytes());
    responder_secret.extend_from_slice(responder.identity.diffie_hellman(&ephemeral_public).as_bytes());
    responder_secret.extend_from_slice(responder.signed_prekey.diffie_hellman(&ephemeral_public).as_bytes());

    if let Some(one_time) = &one_time {
        initiator_secret.extend_from_slice(ephemeral.diffie_hellman(&PublicKey::from(one_time)).as_bytes());
        responder_secret.extend_from_slice(one_time.diffie_hellman(&ephemeral_public).as_bytes());
    }

    let (forward, backward) = derive_chains(&initiator_secret)?;
    if (forward, backward) != derive_chains(&responder_secret)? {
        return Err(CryptoError::Cipher("key agreement mismatch".into()));
    }

    Ok((
        PairwiseSession::new(forward, backward, now),
        PairwiseSession::new(backward, forward, now),
    ))
}

fn derive_chains(shared: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut ikm = vec![0xff_u8; 32];
    ikm.extend_from_slice(shared);
    let hk = Hkdf::<Sha256>::new(Some(&[0_u8; 32]), &ikm);
    let mut okm = [0_u8; 64];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    let mut forward = [0_u8; 32];
    let mut backward = [0_u8; 32];
    forward.copy_from_slice(&okm[..32]);
    backward.copy_from_slice(&okm[32..]);
    Ok((forward, backward))
}

/// Advance a chain key: returns the next chain key and this step's message key.
fn step_chain(chain: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain);
    let mut next = [0_u8; 32];
    let mut message_key = [0_u8; 32];
    hk.expand(CHAIN_INFO, &mut next)
        .and_then(|_| hk.expand(MESSAGE_INFO, &mut message_key))
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok((next, message_key))
}

impl PairwiseSession {
    fn new(send_chain: [u8; 32], recv_chain: [u8; 32], now: DateTime<Utc>) -> Self {
        Self {
            send_chain,
            send_counter: 0,
            recv_chain,
            recv_counter: 0,
            skipped: BTreeMap::new(),
            established_at: now,
        }
    }

    fn next_send_key(&mut self) -> Result<(u32, [u8; 32]), CryptoError> {
        let (next, key) = step_chain(&self.send_chain)?;
        let counter = self.send_counter;
        self.send_chain = next;
        self.send_counter = self.send_counter.wrapping_add(1);
        Ok((counter, key))
    }

    fn recv_key(&mut self, counter: u32) -> Result<[u8; 32], CryptoError> {
        if counter < self.recv_counter {
            return self.skipped.remove(&counter).ok_or(CryptoError::DecryptFailed);
        }
        if counter - self.recv_counter > MAX_SKIP {
            return Err(CryptoError::TooManySkipped);
        }
        while self.recv_counter < counter {
            let (next, key) = step_chain(&self.recv_chain)?;
            self.skipped.insert(self.recv_counter, key);
            self.recv_chain = next;
            self.recv_counter += 1;
        }
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            self.skipped.pop_first();
        }
        let (next, key) = step_chain(&self.recv_chain)?;
        self.recv_chain = next;
        self.recv_counter += 1;
        Ok(key)
    }

    pub fn seal(&mut self, sender_id: i64, recipient_id: i64, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let (counter, key) = self.next_send_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::Cipher(e.to_string()))?;
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(sender_id, recipient_id, counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: aad.as_bytes() })
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        Ok(Envelope {
            sender_id,
            recipient_id,
            counter,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt into a scratch copy so a bad envelope leaves the session untouched.
    pub fn open(&self, envelope: &Envelope) -> Result<(Vec<u8>, PairwiseSession), CryptoError> {
        let nonce = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidEnvelope("bad nonce length".into()));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;

        let mut next = self.clone();
        let key = next.recv_key(envelope.counter)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::Cipher(e.to_string()))?;
        let aad = associated_data(envelope.sender_id, envelope.recipient_id, envelope.counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: aad.as_bytes() })
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok((plaintext, next))
    }
}

fn associated_data(sender_id: i64, recipient_id: i64, counter: u32) -> String {
    format!("parley:{sender_id}:{recipient_id}:{counter}")
}

/// One sealed message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(with = "parley_models::id_str")]
    pub sender_id: i64,
    #[serde(with = "parley_models::id_str")]
    pub recipient_id: i64,
    pub counter: u32,
    pub nonce: String,
    pub ciphertext: String,
}
