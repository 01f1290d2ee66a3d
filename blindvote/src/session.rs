//! The per-election protocol session.
//!
//! ```text
//! Empty -> Initiated -> TokenIssued -> Cast      (cleared)
//!              |             |
//!              +-> TimedOut  +-> Errored         (cleared)
//! ```
//!
//! At most one session exists per device. Every field is persisted under its
//! own key; the election id is written last and deleted first, so a half
//! written session reads as no session at all.

use crate::*;
use rsa::RSAPublicKey;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a token request may stay unanswered
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const KEY_ELECTION_ID: &str = "blindvote.election_id";
const KEY_NONCE: &str = "blindvote.nonce";
const KEY_HASH_BYTES: &str = "blindvote.hash_bytes";
const KEY_BLINDED_MESSAGE: &str = "blindvote.blinded_message";
const KEY_BLINDING_SECRET: &str = "blindvote.blinding_secret";
const KEY_RANDOMIZER: &str = "blindvote.randomizer";
const KEY_COORDINATOR_KEY: &str = "blindvote.coordinator_rsa_key";
const KEY_SIGNATURE: &str = "blindvote.unblinded_signature";
const KEY_CREATED_AT: &str = "blindvote.created_at";
const KEY_TOKEN_PROCESSED_AT: &str = "blindvote.token_processed_at";

// Election id first, see module docs
const ALL_KEYS: [&str; 10] = [
    KEY_ELECTION_ID,
    KEY_NONCE,
    KEY_HASH_BYTES,
    KEY_BLINDED_MESSAGE,
    KEY_BLINDING_SECRET,
    KEY_RANDOMIZER,
    KEY_COORDINATOR_KEY,
    KEY_SIGNATURE,
    KEY_CREATED_AT,
    KEY_TOKEN_PROCESSED_AT,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Initiated,
    TokenIssued,
    Cast,
    Errored,
    TimedOut,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionState::Empty => "empty",
            SessionState::Initiated => "initiated",
            SessionState::TokenIssued => "token_issued",
            SessionState::Cast => "cast",
            SessionState::Errored => "errored",
            SessionState::TimedOut => "timed_out",
        };
        write!(f, "{}", name)
    }
}

/// A snapshot of the persisted session
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub election_id: String,
    pub nonce: Nonce,
    pub hash_bytes: [u8; HASH_LENGTH],
    pub blinding: BlindingContext,
    pub coordinator_key: RSAPublicKey,
    pub unblinded_signature: Option<Vec<u8>>,
    pub created_at: u64,
    pub token_processed_at: Option<u64>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        match self.unblinded_signature {
            Some(_) => SessionState::TokenIssued,
            None => SessionState::Initiated,
        }
    }

    /// An unanswered request older than the token timeout
    pub fn is_expired(&self, now: u64) -> bool {
        self.state() == SessionState::Initiated
            && now.saturating_sub(self.created_at) >= TOKEN_REQUEST_TIMEOUT.as_secs()
    }

    /// Compose the vote token for `candidate_id`
    ///
    /// The token exists only here, at cast time, and is never persisted.
    pub fn vote_payload(&self, candidate_id: u32) -> Result<VotePayload, SessionError> {
        let signature = self.unblinded_signature.as_ref().ok_or(SessionError::WrongState {
            expected: SessionState::TokenIssued,
            found: self.state(),
        })?;
        Ok(VotePayload::new(
            &self.hash_bytes,
            signature,
            &self.blinding.randomizer,
            candidate_id,
        ))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("election_id", &self.election_id)
            .field("state", &self.state())
            .field("hash_bytes", &hex::encode(self.hash_bytes))
            .field("created_at", &self.created_at)
            .field("token_processed_at", &self.token_processed_at)
            .finish()
    }
}

/// Persists the single active session and enforces its state machine
pub struct SessionStore<S: SecureStorage> {
    storage: S,
}

impl<S: SecureStorage> SessionStore<S> {
    pub fn new(storage: S) -> Self {
        SessionStore { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Start a session for `election_id`
    pub async fn start(
        &self,
        election_id: &str,
        nonce: Nonce,
        blinding: &BlindingContext,
        coordinator_key: &RSAPublicKey,
    ) -> Result<(), SessionError> {
        self.start_at(election_id, nonce, blinding, coordinator_key, now())
            .await
    }

    /// Start a session at an explicit time
    ///
    /// Refused while a live session for the same election exists. A session
    /// for another election, an expired request or an unreadable session is
    /// wiped first.
    pub async fn start_at(
        &self,
        election_id: &str,
        nonce: Nonce,
        blinding: &BlindingContext,
        coordinator_key: &RSAPublicKey,
        now: u64,
    ) -> Result<(), SessionError> {
        let hash_bytes = hash(&nonce);
        if blinding.original_hash != hash_bytes {
            return Err(SessionError::Corrupt("hash_bytes"));
        }

        match self.read().await {
            Ok(Some(existing)) if existing.election_id == election_id => {
                if !existing.is_expired(now) {
                    return Err(SessionError::AlreadyActive(election_id.to_owned()));
                }
                debug!(election = %election_id, "replacing expired session");
            }
            Ok(Some(existing)) => {
                debug!(
                    election = %existing.election_id,
                    state = %existing.state(),
                    "discarding session for another election"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "discarding unreadable session"),
        }
        self.clear().await?;

        let coordinator_key = serde_hex::rsa_public_key_to_hex(coordinator_key)
            .map_err(|e| SessionError::Storage(e.to_string()))?;

        self.write(KEY_NONCE, &base64::encode(&nonce)).await?;
        self.write(KEY_HASH_BYTES, &base64::encode(&hash_bytes)).await?;
        self.write(KEY_BLINDED_MESSAGE, &base64::encode(&blinding.blinded_message))
            .await?;
        self.write(KEY_BLINDING_SECRET, &base64::encode(&blinding.secret))
            .await?;
        self.write(KEY_RANDOMIZER, &base64::encode(&blinding.randomizer))
            .await?;
        self.write(KEY_COORDINATOR_KEY, &coordinator_key).await?;
        self.write(KEY_CREATED_AT, &now.to_string()).await?;
        self.write(KEY_ELECTION_ID, election_id).await?;

        info!(election = %election_id, "session initiated");
        Ok(())
    }

    /// Store the verified, unblinded signature
    ///
    /// The randomizer captured at `start` stays authoritative: an echoed
    /// randomizer is only compared, never stored.
    pub async fn complete_with_signature(
        &self,
        election_id: &str,
        unblinded_signature: &[u8],
        echoed_randomizer: Option<&[u8]>,
    ) -> Result<Session, SessionError> {
        let mut session = self.read().await?.ok_or(SessionError::NoSession)?;

        if session.election_id != election_id {
            return Err(SessionError::ForeignElection {
                active: session.election_id,
                received: election_id.to_owned(),
            });
        }
        if session.state() != SessionState::Initiated {
            return Err(SessionError::WrongState {
                expected: SessionState::Initiated,
                found: session.state(),
            });
        }
        if let Some(echoed) = echoed_randomizer {
            if echoed != &session.blinding.randomizer[..] {
                warn!(election = %election_id, "ignoring randomizer echoed by coordinator");
            }
        }

        let processed_at = now();
        self.write(KEY_SIGNATURE, &base64::encode(unblinded_signature))
            .await?;
        self.write(KEY_TOKEN_PROCESSED_AT, &processed_at.to_string())
            .await?;

        session.unblinded_signature = Some(unblinded_signature.to_vec());
        session.token_processed_at = Some(processed_at);

        info!(election = %election_id, "token issued");
        Ok(session)
    }

    /// Read the full session, `None` if there is none
    pub async fn read(&self) -> Result<Option<Session>, SessionError> {
        let election_id = match self.storage.read(KEY_ELECTION_ID).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        let nonce: Nonce = self.read_array(KEY_NONCE, "nonce").await?;
        let hash_bytes: [u8; HASH_LENGTH] = self.read_array(KEY_HASH_BYTES, "hash_bytes").await?;
        let randomizer: [u8; RANDOMIZER_LENGTH] =
            self.read_array(KEY_RANDOMIZER, "randomizer").await?;
        let blinded_message = self
            .read_bytes(KEY_BLINDED_MESSAGE, "blinded_message")
            .await?
            .ok_or(SessionError::Corrupt("blinded_message"))?;
        let secret = self
            .read_bytes(KEY_BLINDING_SECRET, "blinding_secret")
            .await?
            .ok_or(SessionError::Corrupt("blinding_secret"))?;

        let coordinator_key = self
            .storage
            .read(KEY_COORDINATOR_KEY)
            .await?
            .ok_or(SessionError::Corrupt("coordinator_key"))?;
        let coordinator_key = serde_hex::rsa_public_key_from_hex(&coordinator_key)
            .map_err(|_| SessionError::Corrupt("coordinator_key"))?;

        let created_at = self
            .read_number(KEY_CREATED_AT, "created_at")
            .await?
            .ok_or(SessionError::Corrupt("created_at"))?;
        let unblinded_signature = self.read_bytes(KEY_SIGNATURE, "unblinded_signature").await?;
        let token_processed_at = self
            .read_number(KEY_TOKEN_PROCESSED_AT, "token_processed_at")
            .await?;

        Ok(Some(Session {
            election_id,
            nonce,
            hash_bytes,
            blinding: BlindingContext {
                blinded_message,
                secret,
                randomizer,
                original_hash: hash_bytes,
            },
            coordinator_key,
            unblinded_signature,
            created_at,
            token_processed_at,
        }))
    }

    /// Current state, an unreadable session counts as `Empty`
    pub async fn state(&self) -> SessionState {
        match self.read().await {
            Ok(Some(session)) => session.state(),
            _ => SessionState::Empty,
        }
    }

    /// Integrity check: the stored hash must be SHA-256 of the stored nonce
    pub async fn validate(&self) -> bool {
        match self.read().await {
            Ok(Some(session)) => hash(&session.nonce) == session.hash_bytes,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "session failed to load");
                false
            }
        }
    }

    /// End the session with a terminal outcome
    pub async fn finish(&self, outcome: SessionState) -> Result<(), SessionError> {
        self.clear().await?;
        info!(outcome = %outcome, "session closed");
        Ok(())
    }

    /// Wipe every session field. Safe to call repeatedly.
    pub async fn clear(&self) -> Result<(), SessionError> {
        for key in ALL_KEYS.iter() {
            self.storage.delete(key).await?;
        }
        Ok(())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.storage.write(key, value).await
    }

    async fn read_bytes(&self, key: &str, field: &'static str) -> Result<Option<Vec<u8>>, SessionError> {
        match self.storage.read(key).await? {
            Some(value) => base64::decode(&value)
                .map(Some)
                .map_err(|_| SessionError::Corrupt(field)),
            None => Ok(None),
        }
    }

    async fn read_array<A>(&self, key: &str, field: &'static str) -> Result<A, SessionError>
    where
        A: Default + AsMut<[u8]>,
    {
        let bytes = self
            .read_bytes(key, field)
            .await?
            .ok_or(SessionError::Corrupt(field))?;
        let mut array = A::default();
        if array.as_mut().len() != bytes.len() {
            return Err(SessionError::Corrupt(field));
        }
        array.as_mut().copy_from_slice(&bytes);
        Ok(array)
    }

    async fn read_number(&self, key: &str, field: &'static str) -> Result<Option<u64>, SessionError> {
        match self.storage.read(key).await? {
            Some(value) => u64::from_str(&value)
                .map(Some)
                .map_err(|_| SessionError::Corrupt(field)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{blind_sign, test_rsa_key};

    const ELECTION: &str = "election-1";

    fn new_store() -> SessionStore<MemoryStorage> {
        SessionStore::new(MemoryStorage::new())
    }

    fn blinded(nonce: &Nonce) -> (BlindingContext, RSAPublicKey) {
        let key = test_rsa_key().to_public_key();
        let ctx = blind(&hash(nonce), &key).unwrap();
        (ctx, key)
    }

    fn signature_for(ctx: &BlindingContext, key: &RSAPublicKey) -> Vec<u8> {
        let blind_sig = blind_sign(&ctx.blinded_message);
        unblind(&blind_sig, &ctx.secret, &ctx.randomizer, &ctx.original_hash, key).unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = new_store();
        assert_eq!(store.state().await, SessionState::Empty);
        assert!(store.read().await.unwrap().is_none());
        assert!(!store.validate().await);

        let nonce = [0u8; NONCE_LENGTH];
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();

        let session = store.read().await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Initiated);
        assert_eq!(session.election_id, ELECTION);
        assert_eq!(session.hash_bytes, hash(&nonce));
        assert_eq!(session.blinding, ctx);
        assert_eq!(session.coordinator_key, key);
        assert_eq!(session.created_at, 1_000);
        assert!(store.validate().await);

        let sig = signature_for(&ctx, &key);
        let completed = store
            .complete_with_signature(ELECTION, &sig, None)
            .await
            .unwrap();
        assert_eq!(completed.state(), SessionState::TokenIssued);
        assert_eq!(store.read().await.unwrap().unwrap(), completed);

        let payload = completed.vote_payload(3).unwrap();
        assert!(payload.verify(&key));

        store.finish(SessionState::Cast).await.unwrap();
        assert_eq!(store.state().await, SessionState::Empty);
        assert!(store.storage().is_empty().await);

        // Idempotent
        store.clear().await.unwrap();
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_flight() {
        let store = new_store();
        let nonce = generate_nonce().unwrap();
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();

        let other_nonce = generate_nonce().unwrap();
        let (other_ctx, _) = blinded(&other_nonce);
        let second = store
            .start_at(ELECTION, other_nonce, &other_ctx, &key, 1_010)
            .await;
        assert!(matches!(second, Err(SessionError::AlreadyActive(_))));

        // The first blinding context survives
        assert_eq!(store.read().await.unwrap().unwrap().blinding, ctx);

        // Once the request expires, a new one may start
        let later = 1_000 + TOKEN_REQUEST_TIMEOUT.as_secs();
        store
            .start_at(ELECTION, other_nonce, &other_ctx, &key, later)
            .await
            .unwrap();
        let session = store.read().await.unwrap().unwrap();
        assert_eq!(session.blinding, other_ctx);
        assert_eq!(session.created_at, later);
    }

    #[tokio::test]
    async fn test_issued_token_blocks_restart() {
        let store = new_store();
        let nonce = generate_nonce().unwrap();
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();
        let sig = signature_for(&ctx, &key);
        store.complete_with_signature(ELECTION, &sig, None).await.unwrap();

        // An issued token never expires by itself
        let result = store.start_at(ELECTION, nonce, &ctx, &key, 1_000_000).await;
        assert!(matches!(result, Err(SessionError::AlreadyActive(_))));

        // A different election wipes the stale token
        store.start_at("election-2", nonce, &ctx, &key, 2_000).await.unwrap();
        let session = store.read().await.unwrap().unwrap();
        assert_eq!(session.election_id, "election-2");
        assert_eq!(session.state(), SessionState::Initiated);
        assert!(session.unblinded_signature.is_none());
    }

    #[tokio::test]
    async fn test_complete_checks_state() {
        let store = new_store();
        assert!(matches!(
            store.complete_with_signature(ELECTION, &[1, 2, 3], None).await,
            Err(SessionError::NoSession)
        ));

        let nonce = generate_nonce().unwrap();
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();

        assert!(matches!(
            store.complete_with_signature("election-2", &[1, 2, 3], None).await,
            Err(SessionError::ForeignElection { .. })
        ));

        let sig = signature_for(&ctx, &key);
        store.complete_with_signature(ELECTION, &sig, None).await.unwrap();
        assert!(matches!(
            store.complete_with_signature(ELECTION, &sig, None).await,
            Err(SessionError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn test_echoed_randomizer_is_ignored() {
        let store = new_store();
        let nonce = generate_nonce().unwrap();
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();

        let sig = signature_for(&ctx, &key);
        let substituted = [0xAAu8; RANDOMIZER_LENGTH];
        let session = store
            .complete_with_signature(ELECTION, &sig, Some(&substituted))
            .await
            .unwrap();

        assert_eq!(session.blinding.randomizer, ctx.randomizer);
        let stored = store.read().await.unwrap().unwrap();
        assert_eq!(stored.blinding.randomizer, ctx.randomizer);
        assert!(stored.vote_payload(1).unwrap().verify(&key));
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let store = new_store();
        let nonce = generate_nonce().unwrap();
        let (ctx, key) = blinded(&nonce);
        store.start_at(ELECTION, nonce, &ctx, &key, 1_000).await.unwrap();

        // A hash that is not SHA-256 of the nonce
        let bogus = base64::encode(&[9u8; HASH_LENGTH]);
        store.storage().write(KEY_HASH_BYTES, &bogus).await.unwrap();
        assert!(!store.validate().await);

        // A lost randomizer voids the session
        store.storage().delete(KEY_RANDOMIZER).await.unwrap();
        assert!(matches!(
            store.read().await,
            Err(SessionError::Corrupt("randomizer"))
        ));
        assert_eq!(store.state().await, SessionState::Empty);

        // Corrupt sessions never block a fresh start
        store.start_at(ELECTION, nonce, &ctx, &key, 1_001).await.unwrap();
        assert!(store.validate().await);
    }

    #[tokio::test]
    async fn test_start_rejects_mismatched_hash() {
        let store = new_store();
        let (ctx, key) = blinded(&[1u8; NONCE_LENGTH]);
        let result = store.start_at(ELECTION, [2u8; NONCE_LENGTH], &ctx, &key, 1).await;
        assert!(matches!(result, Err(SessionError::Corrupt("hash_bytes"))));
        assert_eq!(store.state().await, SessionState::Empty);
    }
}
