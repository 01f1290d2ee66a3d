use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope timestamps are pushed up to two days into the past
pub const TIMESTAMP_TWEAK_SECS: u64 = 2 * 24 * 60 * 60;

pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let mut csprng = rand::rngs::OsRng {};
    let Keypair { public, secret } = Keypair::generate(&mut csprng);
    (secret, public)
}

/// Current unix time in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A timestamp somewhere in the two days before `now`, hiding when an envelope was really sent
pub fn tweaked_timestamp(now: u64) -> u64 {
    let tweak = rand::rngs::OsRng.gen_range(0, TIMESTAMP_TWEAK_SECS);
    now.saturating_sub(tweak)
}
