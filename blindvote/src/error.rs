use crate::*;

use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("blindvote: {0}")]
    Validation(#[from] ValidationError),

    #[error("blindvote: {0}")]
    Crypto(#[from] CryptoError),

    #[error("blindvote: {0}")]
    Session(#[from] SessionError),

    #[error("blindvote: {0}")]
    Transport(#[from] TransportError),

    #[error("blindvote: coordinator error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("blindvote: secure randomness unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("blindvote: no token response within {0} seconds")]
    TokenTimeout(u64),

    #[error("blindvote: election {0} is not open")]
    ElectionNotOpen(String),

    #[error("blindvote: candidate {0} does not exist in election")]
    UnknownCandidate(u32),

    #[error("blindvote: invalid configuration: {0}")]
    Config(String),
}

/// Wire message validation errors
///
/// A message failing validation is dropped and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message validation: malformed json")]
    MalformedJson,

    #[error("message validation: message of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("message validation: missing field `{0}`")]
    MissingField(&'static str),

    #[error("message validation: wrong type for field `{0}`")]
    WrongType(&'static str),

    #[error("message validation: unknown kind {0}")]
    UnknownKind(i64),

    #[error("message validation: payload is not valid for kind {0}")]
    BadPayloadEncoding(MessageKind),

    #[error("message validation: malformed vote payload: {0}")]
    MalformedVotePayload(&'static str),
}

/// Blind signature errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("crypto: invalid {what} length: expected {expected}, found {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("crypto: randomizer missing, the partial token is void")]
    MissingRandomizer,

    #[error("crypto: signature verification failed")]
    VerificationFailed,

    #[error("crypto: RSA error: {0}")]
    Rsa(#[from] rsa::errors::Error),

    #[error("crypto: full-domain-hash error: {0}")]
    Fdh(String),
}

/// Session storage errors
///
/// Callers treat all of these as "no usable token" and restart token acquisition.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session: no active session")]
    NoSession,

    #[error("session: a session for election {0} is already in flight")]
    AlreadyActive(String),

    #[error("session: expected state {expected}, found {found}")]
    WrongState {
        expected: SessionState,
        found: SessionState,
    },

    #[error("session: response for election {received} does not match active election {active}")]
    ForeignElection { active: String, received: String },

    #[error("session: corrupt session field `{0}`")]
    Corrupt(&'static str),

    #[error("session: storage failure: {0}")]
    Storage(String),
}

/// Envelope and relay errors
///
/// An envelope that fails to open is dropped; this is never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport: unexpected event kind {0}")]
    UnexpectedKind(u16),

    #[error("transport: bad event signature")]
    BadSignature,

    #[error("transport: event id does not match its content")]
    BadEventId,

    #[error("transport: decryption failed")]
    Decryption,

    #[error("transport: malformed envelope: {0}")]
    Malformed(String),

    #[error("transport: seal signer does not match rumor author")]
    SenderMismatch,

    #[error("transport: message from {0}, who is not the election coordinator")]
    UnexpectedSender(String),

    #[error("transport: identity may not carry a {0} message")]
    WrongIdentityForKind(MessageKind),

    #[error("transport: relay error: {0}")]
    Relay(String),
}

/// Categorized coordinator-reported error, carried in a kind 3 message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("voter is not authorized for this election")]
    UnauthorizedVoter,

    #[error("a token was already issued for this nonce hash")]
    NonceHashAlreadyIssued,

    #[error("election not found")]
    ElectionNotFound,

    #[error("election is closed")]
    ElectionClosed,

    #[error("{0}")]
    Unknown(String),
}

impl ProtocolError {
    /// Map a coordinator error payload onto a category
    pub fn from_payload(payload: &str) -> Self {
        match payload.trim() {
            "unauthorized-voter" => ProtocolError::UnauthorizedVoter,
            "nonce-hash-already-issued" => ProtocolError::NonceHashAlreadyIssued,
            "election-not-found" => ProtocolError::ElectionNotFound,
            "election-closed" => ProtocolError::ElectionClosed,
            other => ProtocolError::Unknown(other.to_owned()),
        }
    }

    /// Whether the voter can retry from scratch, in which case the session is cleared
    pub fn clears_session(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnauthorizedVoter | ProtocolError::NonceHashAlreadyIssued
        )
    }

    /// The wire value of this category
    pub fn code(&self) -> &str {
        match self {
            ProtocolError::UnauthorizedVoter => "unauthorized-voter",
            ProtocolError::NonceHashAlreadyIssued => "nonce-hash-already-issued",
            ProtocolError::ElectionNotFound => "election-not-found",
            ProtocolError::ElectionClosed => "election-closed",
            ProtocolError::Unknown(s) => s,
        }
    }
}
