//! Encrypted envelopes carrying protocol messages.
//!
//! A message travels as three nested events:
//!
//! - rumor: unsigned, authored by the sender, carries the message JSON and the
//!   canonical timestamp.
//! - seal: signed by the sender, content is the rumor encrypted to the recipient.
//! - wrap: signed by a key that exists for this one envelope only, tagged with
//!   the recipient, content is the seal encrypted to the recipient.
//!
//! Seal and wrap timestamps are randomized and say nothing about freshness.
//! Only the rumor's timestamp is checked against the maximum age.
//!
//! Votes are sealed by a [`OneTimeIdentity`] instead of the voter's long-term
//! [`Identity`], so nothing links the vote to the voter. The one-time identity
//! is consumed when the envelope is built.

use crate::*;
use ed25519_dalek::{PublicKey, SecretKey};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Rumors older than this are dropped
pub const MAX_RUMOR_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Rumors dated further than this into the future are dropped
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(15 * 60);

/// The voter's long-term identity, derived from its key material
///
/// May carry Token and Error messages. Never Votes.
pub struct Identity {
    secret: SecretKey,
    public: PublicKey,
}

impl Identity {
    pub fn new(secret: SecretKey) -> Self {
        let public: PublicKey = (&secret).into();
        Identity { secret, public }
    }

    pub fn generate() -> Self {
        let (secret, public) = generate_keypair();
        Identity { secret, public }
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("{}", e))?;
        let secret = SecretKey::from_bytes(&bytes).map_err(|e| format!("{}", e))?;
        Ok(Identity::new(secret))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Identity({})", self.public_hex())
    }
}

/// A single-use identity for casting one vote
///
/// Not `Clone`. Sealing a vote consumes it, so it can never sign a second
/// envelope.
pub struct OneTimeIdentity {
    secret: SecretKey,
    public: PublicKey,
}

impl OneTimeIdentity {
    pub fn generate() -> Self {
        let (secret, public) = generate_keypair();
        OneTimeIdentity { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

/// A successfully opened envelope
#[derive(Clone, Debug)]
pub struct OpenedEnvelope {
    /// Id of the outer wrap event
    pub envelope_id: String,

    /// The seal signer, equal to the rumor author
    pub sender: PublicKey,

    pub rumor: UnsignedEvent,
}

/// Builds and opens envelopes on behalf of the voter
pub struct EnvelopeTransport {
    identity: Identity,
    max_rumor_age: Duration,
}

impl EnvelopeTransport {
    pub fn new(identity: Identity) -> Self {
        EnvelopeTransport {
            identity,
            max_rumor_age: MAX_RUMOR_AGE,
        }
    }

    pub fn with_max_rumor_age(mut self, max_rumor_age: Duration) -> Self {
        self.max_rumor_age = max_rumor_age;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Wrap a Token or Error message, sealed by the voter's long-term identity
    pub fn wrap(&self, recipient: &PublicKey, message: &Message) -> Result<Event, TransportError> {
        if message.kind == MessageKind::Vote {
            return Err(TransportError::WrongIdentityForKind(message.kind));
        }
        seal_and_wrap(
            &self.identity.secret,
            &self.identity.public,
            recipient,
            message,
            now(),
        )
    }

    /// Wrap a Vote message, sealed by a fresh identity that is dropped afterwards
    pub fn wrap_vote(&self, recipient: &PublicKey, message: &Message) -> Result<Event, TransportError> {
        wrap_vote_with(OneTimeIdentity::generate(), recipient, message)
    }

    /// Open an envelope addressed to the voter
    ///
    /// Returns `Ok(None)` for a rumor older than the maximum age or dated
    /// beyond the allowed clock skew. That is not an error, the message is
    /// just stale.
    pub fn open(&self, event: &Event) -> Result<Option<OpenedEnvelope>, TransportError> {
        open_envelope(&self.identity.secret, event, now(), self.max_rumor_age)
    }
}

/// Wrap a vote with the given one-time identity, consuming it
pub fn wrap_vote_with(
    one_time: OneTimeIdentity,
    recipient: &PublicKey,
    message: &Message,
) -> Result<Event, TransportError> {
    if message.kind != MessageKind::Vote {
        return Err(TransportError::WrongIdentityForKind(message.kind));
    }
    seal_and_wrap(&one_time.secret, &one_time.public, recipient, message, now())
}

/// Build the rumor, seal and wrap layers
pub fn seal_and_wrap(
    sender_secret: &SecretKey,
    sender_public: &PublicKey,
    recipient: &PublicKey,
    message: &Message,
    now: u64,
) -> Result<Event, TransportError> {
    let rumor = UnsignedEvent::new(sender_public, now, KIND_RUMOR, vec![], message.to_json());
    let rumor_json = to_json(&rumor)?;

    let sealed = encrypt_to(recipient, rumor_json.as_bytes())?;
    let seal = UnsignedEvent::new(sender_public, tweaked_timestamp(now), KIND_SEAL, vec![], sealed)
        .sign(sender_secret, sender_public);
    let seal_json = to_json(&seal)?;

    let (wrap_secret, wrap_public) = generate_keypair();
    let wrapped = encrypt_to(recipient, seal_json.as_bytes())?;
    let tags = vec![vec!["p".to_owned(), hex::encode(recipient.as_bytes())]];
    let wrap = UnsignedEvent::new(&wrap_public, tweaked_timestamp(now), KIND_GIFT_WRAP, tags, wrapped)
        .sign(&wrap_secret, &wrap_public);

    Ok(wrap)
}

/// Open an envelope with the recipient's secret key
pub fn open_envelope(
    recipient_secret: &SecretKey,
    event: &Event,
    now: u64,
    max_rumor_age: Duration,
) -> Result<Option<OpenedEnvelope>, TransportError> {
    if event.kind != KIND_GIFT_WRAP {
        return Err(TransportError::UnexpectedKind(event.kind));
    }
    event.verify()?;

    let seal: Event = decrypt_from(recipient_secret, &event.content)?;
    if seal.kind != KIND_SEAL {
        return Err(TransportError::UnexpectedKind(seal.kind));
    }
    seal.verify()?;

    let rumor: UnsignedEvent = decrypt_from(recipient_secret, &seal.content)?;
    if rumor.pubkey != seal.pubkey {
        return Err(TransportError::SenderMismatch);
    }
    if !rumor.verify_id() {
        return Err(TransportError::BadEventId);
    }

    // The wrap and seal timestamps are randomized, only the rumor's counts
    if rumor.created_at > now.saturating_add(MAX_CLOCK_SKEW.as_secs()) {
        debug!(envelope = %event.id, created_at = rumor.created_at, "dropping rumor dated in the future");
        return Ok(None);
    }
    let age = now.saturating_sub(rumor.created_at);
    if age > max_rumor_age.as_secs() {
        debug!(envelope = %event.id, age, "dropping stale rumor");
        return Ok(None);
    }

    Ok(Some(OpenedEnvelope {
        envelope_id: event.id.clone(),
        sender: seal.author()?,
        rumor,
    }))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, TransportError> {
    serde_json::to_string(value).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn encrypt_to(recipient: &PublicKey, plaintext: &[u8]) -> Result<String, TransportError> {
    let encrypted = ecies_ed25519::encrypt(recipient, plaintext)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;
    Ok(base64::encode(&encrypted))
}

fn decrypt_from<T: serde::de::DeserializeOwned>(
    recipient_secret: &SecretKey,
    content: &str,
) -> Result<T, TransportError> {
    let encrypted = base64::decode(content).map_err(|e| TransportError::Malformed(e.to_string()))?;
    let plaintext =
        ecies_ed25519::decrypt(recipient_secret, &encrypted).map_err(|_| TransportError::Decryption)?;
    serde_json::from_slice(&plaintext).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_message() -> Message {
        Message::token("election-1", &[7u8; 256])
    }

    fn vote_message() -> Message {
        let payload = VotePayload::new(&[1u8; 32], &[2u8; 256], &[3u8; 32], 1);
        Message::vote("election-1", &payload)
    }

    #[test]
    fn test_wrap_and_open() {
        let voter = EnvelopeTransport::new(Identity::generate());
        let coordinator = EnvelopeTransport::new(Identity::generate());

        let wrap = voter
            .wrap(coordinator.identity().public_key(), &token_message())
            .unwrap();
        assert_eq!(wrap.kind, KIND_GIFT_WRAP);
        assert_eq!(
            wrap.tag_values("p").collect::<Vec<_>>(),
            vec![coordinator.identity().public_hex()]
        );

        // The outer layer does not reveal the sender
        assert_ne!(wrap.pubkey, voter.identity().public_hex());

        let opened = coordinator.open(&wrap).unwrap().unwrap();
        assert_eq!(&opened.sender, voter.identity().public_key());
        assert_eq!(opened.envelope_id, wrap.id);
        assert_eq!(Message::decode(&opened.rumor.content).unwrap(), token_message());

        // Only the recipient can open it
        assert!(matches!(voter.open(&wrap), Err(TransportError::Decryption)));
    }

    #[test]
    fn test_identity_kind_rules() {
        let voter = EnvelopeTransport::new(Identity::generate());
        let coordinator = Identity::generate();

        assert!(matches!(
            voter.wrap(coordinator.public_key(), &vote_message()),
            Err(TransportError::WrongIdentityForKind(MessageKind::Vote))
        ));
        assert!(matches!(
            voter.wrap_vote(coordinator.public_key(), &token_message()),
            Err(TransportError::WrongIdentityForKind(MessageKind::Token))
        ));
    }

    #[test]
    fn test_vote_is_unlinkable() {
        let voter = EnvelopeTransport::new(Identity::generate());
        let coordinator = EnvelopeTransport::new(Identity::generate());
        let recipient = coordinator.identity().public_key();

        let first = voter.wrap_vote(recipient, &vote_message()).unwrap();
        let second = voter.wrap_vote(recipient, &vote_message()).unwrap();

        let first = coordinator.open(&first).unwrap().unwrap();
        let second = coordinator.open(&second).unwrap().unwrap();

        assert_ne!(&first.sender, voter.identity().public_key());
        assert_ne!(&second.sender, voter.identity().public_key());
        assert_ne!(first.sender, second.sender);
    }

    #[test]
    fn test_stale_rumor_is_dropped() {
        let (voter_secret, voter_public) = generate_keypair();
        let (coordinator_secret, coordinator_public) = generate_keypair();
        let sent_at = 1_700_000_000;

        let wrap = seal_and_wrap(
            &voter_secret,
            &voter_public,
            &coordinator_public,
            &token_message(),
            sent_at,
        )
        .unwrap();

        let fresh = open_envelope(&coordinator_secret, &wrap, sent_at + 60, MAX_RUMOR_AGE).unwrap();
        assert!(fresh.is_some());

        let day = MAX_RUMOR_AGE.as_secs();
        let edge = open_envelope(&coordinator_secret, &wrap, sent_at + day, MAX_RUMOR_AGE).unwrap();
        assert!(edge.is_some());

        let stale = open_envelope(&coordinator_secret, &wrap, sent_at + day + 1, MAX_RUMOR_AGE).unwrap();
        assert!(stale.is_none());
    }

    #[test]
    fn test_future_rumor_is_dropped() {
        let (voter_secret, voter_public) = generate_keypair();
        let (coordinator_secret, coordinator_public) = generate_keypair();
        let now = 1_700_000_000;
        let skew = MAX_CLOCK_SKEW.as_secs();

        let wrap_at = |sent_at| {
            seal_and_wrap(&voter_secret, &voter_public, &coordinator_public, &token_message(), sent_at)
                .unwrap()
        };

        let slightly_ahead = wrap_at(now + skew);
        assert!(open_envelope(&coordinator_secret, &slightly_ahead, now, MAX_RUMOR_AGE)
            .unwrap()
            .is_some());

        // A far-future rumor would otherwise never go stale
        let far_ahead = wrap_at(now + skew + 1);
        assert!(open_envelope(&coordinator_secret, &far_ahead, now, MAX_RUMOR_AGE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_envelope_timestamps_are_not_used_for_freshness() {
        let (voter_secret, voter_public) = generate_keypair();
        let (coordinator_secret, coordinator_public) = generate_keypair();
        let now = 1_700_000_000;

        let mut wrap =
            seal_and_wrap(&voter_secret, &voter_public, &coordinator_public, &token_message(), now)
                .unwrap();
        assert!(wrap.created_at <= now);

        // Re-sign the wrap with an ancient timestamp, the rumor inside is still fresh
        let (wrap_secret, wrap_public) = generate_keypair();
        wrap = UnsignedEvent::new(&wrap_public, 0, KIND_GIFT_WRAP, wrap.tags, wrap.content)
            .sign(&wrap_secret, &wrap_public);

        assert!(open_envelope(&coordinator_secret, &wrap, now, MAX_RUMOR_AGE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let voter = EnvelopeTransport::new(Identity::generate());
        let coordinator = EnvelopeTransport::new(Identity::generate());
        let wrap = voter
            .wrap(coordinator.identity().public_key(), &token_message())
            .unwrap();

        let mut wrong_kind = wrap.clone();
        wrong_kind.kind = KIND_SEAL;
        assert!(matches!(
            coordinator.open(&wrong_kind),
            Err(TransportError::UnexpectedKind(KIND_SEAL))
        ));

        let mut tampered = wrap.clone();
        tampered.content.push('A');
        assert!(coordinator.open(&tampered).is_err());
    }

    #[test]
    fn test_impersonation_is_rejected() {
        // A seal signed by the attacker carrying a rumor claiming to be the voter
        let (_, victim_public) = generate_keypair();
        let (attacker_secret, attacker_public) = generate_keypair();
        let (coordinator_secret, coordinator_public) = generate_keypair();
        let now = 1_700_000_000;

        let rumor = UnsignedEvent::new(&victim_public, now, KIND_RUMOR, vec![], token_message().to_json());
        let sealed = encrypt_to(&coordinator_public, serde_json::to_string(&rumor).unwrap().as_bytes()).unwrap();
        let seal = UnsignedEvent::new(&attacker_public, now, KIND_SEAL, vec![], sealed)
            .sign(&attacker_secret, &attacker_public);

        let (wrap_secret, wrap_public) = generate_keypair();
        let wrapped = encrypt_to(&coordinator_public, serde_json::to_string(&seal).unwrap().as_bytes()).unwrap();
        let wrap = UnsignedEvent::new(&wrap_public, now, KIND_GIFT_WRAP, vec![], wrapped)
            .sign(&wrap_secret, &wrap_public);

        assert!(matches!(
            open_envelope(&coordinator_secret, &wrap, now, MAX_RUMOR_AGE),
            Err(TransportError::SenderMismatch)
        ));
    }
}
