use crate::*;
use digest::Digest;
use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey, Signature};
use sha2::Sha256;
use std::convert::TryFrom;

/// The decrypted inner payload of an envelope
pub const KIND_RUMOR: u16 = 14;

/// The sender-signed middle layer of an envelope
pub const KIND_SEAL: u16 = 13;

/// The outer, throwaway-signed layer of an envelope
pub const KIND_GIFT_WRAP: u16 = 1059;

/// Election definitions, a parameterized replaceable event
pub const KIND_ELECTION: u16 = 35000;

/// Election results, a parameterized replaceable event
pub const KIND_ELECTION_RESULTS: u16 = 35001;

/// An event without a signature
///
/// Rumors are never signed, so a leaked rumor cannot be proven to come from its author.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A signed relay event
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl UnsignedEvent {
    pub fn new(
        author: &PublicKey,
        created_at: u64,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let pubkey = hex::encode(author.as_bytes());
        let id = hex::encode(compute_id(&pubkey, created_at, kind, &tags, &content));
        UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Recompute the id and compare it to the stored one
    pub fn verify_id(&self) -> bool {
        let id = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        hex::encode(id) == self.id
    }

    /// Sign the event id with `secret`, which must belong to the event author
    pub fn sign(self, secret: &SecretKey, public: &PublicKey) -> Event {
        let id_bytes = hex::decode(&self.id).unwrap_or_default();
        let expanded: ExpandedSecretKey = secret.into();
        let signature = expanded.sign(&id_bytes, public);

        Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(signature.to_bytes()),
        }
    }
}

impl Event {
    /// Verify the id and the author's signature over it
    pub fn verify(&self) -> Result<(), TransportError> {
        let id = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(id) != self.id {
            return Err(TransportError::BadEventId);
        }

        let author = self.author()?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| TransportError::BadSignature)?;
        let signature = Signature::try_from(&sig_bytes[..]).map_err(|_| TransportError::BadSignature)?;

        author
            .verify_strict(&id, &signature)
            .map_err(|_| TransportError::BadSignature)
    }

    pub fn author(&self) -> Result<PublicKey, TransportError> {
        serde_hex::public_key_from_hex(&self.pubkey).map_err(TransportError::Malformed)
    }

    /// Values of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

/// sha256 over `[0, pubkey, created_at, kind, tags, content]`
fn compute_id(pubkey: &str, created_at: u64, kind: u16, tags: &[Vec<String>], content: &str) -> [u8; 32] {
    let canonical = serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content))
        .unwrap_or_default();
    let mut id = [0u8; 32];
    id.copy_from_slice(&Sha256::digest(&canonical));
    id
}
