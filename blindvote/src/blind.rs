//! RSA blind signatures over the voter's nonce hash.
//!
//! The message that gets blinded is `randomizer || h_n`, hashed onto the
//! coordinator's modulus with a full-domain hash. The randomizer is fresh for
//! every blinding and must be carried through to unblinding and to every
//! later verification, otherwise the token does not verify.

use crate::*;
use digest::Digest;
use rand::RngCore;
use rand_core::CryptoRng;
use rsa::{BigUint, PublicKeyParts, RSAPublicKey};
use rsa_fdh::blind as fdh;
use sha2::Sha256;
use std::fmt;

pub const NONCE_LENGTH: usize = 16;
pub const HASH_LENGTH: usize = 32;
pub const RANDOMIZER_LENGTH: usize = 32;

pub type Nonce = [u8; NONCE_LENGTH];

/// Everything produced by blinding that is needed to turn the coordinator's
/// blind signature into a usable token.
#[derive(Clone, PartialEq, Eq)]
pub struct BlindingContext {
    /// Sent to the coordinator, padded to the modulus length
    pub blinded_message: Vec<u8>,

    /// The blinding factor. Never leaves the device.
    pub secret: Vec<u8>,

    pub randomizer: [u8; RANDOMIZER_LENGTH],
    pub original_hash: [u8; HASH_LENGTH],
}

impl fmt::Debug for BlindingContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlindingContext")
            .field("blinded_message_len", &self.blinded_message.len())
            .field("secret", &"<redacted>")
            .field("randomizer", &"<redacted>")
            .field("original_hash", &hex::encode(self.original_hash))
            .finish()
    }
}

/// Generate a fresh voter nonce from the OS RNG
///
/// Failure here means there is no secure randomness, which is fatal.
pub fn generate_nonce() -> Result<Nonce, Error> {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::RandomnessUnavailable(e.to_string()))?;
    Ok(nonce)
}

/// SHA-256 of the nonce, the `h_n` that gets signed
pub fn hash(nonce: &[u8]) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(&Sha256::digest(nonce));
    out
}

/// Blind `hash` for the coordinator key using the OS RNG
pub fn blind(hash: &[u8], coordinator_key: &RSAPublicKey) -> Result<BlindingContext, CryptoError> {
    blind_with_rng(&mut rand::rngs::OsRng, hash, coordinator_key)
}

/// Blind `hash` for the coordinator key
///
/// Every call draws a new randomizer and blinding factor, so blinding the same
/// hash twice never gives the same blinded message.
pub fn blind_with_rng<R: RngCore + CryptoRng>(
    rng: &mut R,
    hash: &[u8],
    coordinator_key: &RSAPublicKey,
) -> Result<BlindingContext, CryptoError> {
    let original_hash = to_hash(hash)?;

    let mut randomizer = [0u8; RANDOMIZER_LENGTH];
    rng.fill_bytes(&mut randomizer);

    let digest = randomized_digest(&randomizer, &original_hash, coordinator_key)?;
    let (blinded, secret) = fdh::blind(rng, coordinator_key, &digest);

    let modulus_len = modulus_len(coordinator_key);
    Ok(BlindingContext {
        blinded_message: left_pad(blinded, modulus_len),
        secret,
        randomizer,
        original_hash,
    })
}

/// Remove the blinding factor from the coordinator's blind signature
///
/// The resulting signature is checked against the original hash before it is
/// returned, so a wrong key, a wrong secret or a wrong randomizer all surface
/// here as errors.
pub fn unblind(
    blind_signature: &[u8],
    secret: &[u8],
    randomizer: &[u8],
    original_hash: &[u8],
    coordinator_key: &RSAPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    if randomizer.is_empty() {
        return Err(CryptoError::MissingRandomizer);
    }
    check_len("randomizer", randomizer, RANDOMIZER_LENGTH)?;
    check_len("hash", original_hash, HASH_LENGTH)?;

    let modulus_len = modulus_len(coordinator_key);
    check_max_len("blind signature", blind_signature, modulus_len)?;
    check_max_len("blinding secret", secret, modulus_len)?;

    let signature = fdh::unblind(coordinator_key, blind_signature, secret);
    let signature = left_pad(signature, modulus_len);

    if !verify(&signature, randomizer, original_hash, coordinator_key) {
        return Err(CryptoError::VerificationFailed);
    }

    Ok(signature)
}

/// Verify an unblinded signature over `message` (the nonce hash)
///
/// Never fails: any inconsistency in the inputs means the signature is not valid.
pub fn verify(
    signature: &[u8],
    randomizer: &[u8],
    message: &[u8],
    coordinator_key: &RSAPublicKey,
) -> bool {
    if randomizer.len() != RANDOMIZER_LENGTH || signature.is_empty() {
        return false;
    }
    if signature.len() > modulus_len(coordinator_key) {
        return false;
    }

    let digest = match randomized_digest(randomizer, message, coordinator_key) {
        Ok(digest) => digest,
        Err(_) => return false,
    };

    fdh::verify(coordinator_key, &digest, signature).is_ok()
}

/// Whether `blind_signature` is the coordinator's signature over `blinded_message`
///
/// Tells a reply to this request apart from a reply to an earlier one, which
/// unblinds to garbage against the current blinding secret.
pub fn signs_blinded(
    blind_signature: &[u8],
    blinded_message: &[u8],
    coordinator_key: &RSAPublicKey,
) -> bool {
    let signature = BigUint::from_bytes_be(blind_signature);
    if &signature >= coordinator_key.n() {
        return false;
    }
    let recovered = signature.modpow(coordinator_key.e(), coordinator_key.n());
    recovered == BigUint::from_bytes_be(blinded_message)
}

/// Length of the coordinator modulus in bytes
pub fn modulus_len(key: &RSAPublicKey) -> usize {
    (key.n().bits() + 7) / 8
}

fn randomized_digest(
    randomizer: &[u8],
    message: &[u8],
    key: &RSAPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut prefixed = Vec::with_capacity(randomizer.len() + message.len());
    prefixed.extend_from_slice(randomizer);
    prefixed.extend_from_slice(message);

    fdh::hash_message::<Sha256, _>(key, &prefixed).map_err(|e| CryptoError::Fdh(format!("{:?}", e)))
}

fn to_hash(bytes: &[u8]) -> Result<[u8; HASH_LENGTH], CryptoError> {
    check_len("hash", bytes, HASH_LENGTH)?;
    let mut hash = [0u8; HASH_LENGTH];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

fn check_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<(), CryptoError> {
    if bytes.len() != expected {
        return Err(CryptoError::InvalidLength {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn check_max_len(what: &'static str, bytes: &[u8], max: usize) -> Result<(), CryptoError> {
    if bytes.is_empty() || bytes.len() > max {
        return Err(CryptoError::InvalidLength {
            what,
            expected: max,
            actual: bytes.len(),
        });
    }
    Ok(())
}

// Big-endian integers lose their leading zeros, put them back
fn left_pad(bytes: Vec<u8>, len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes;
    }
    let mut padded = vec![0u8; len - bytes.len()];
    padded.extend(bytes);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{blind_sign, other_rsa_key, test_rsa_key};

    #[test]
    fn test_nonce_and_hash() {
        let a = generate_nonce().unwrap();
        let b = generate_nonce().unwrap();
        assert_eq!(a.len(), NONCE_LENGTH);
        assert_ne!(a, b);

        let zero_hash = hash(&[0u8; NONCE_LENGTH]);
        assert_eq!(
            hex::encode(zero_hash),
            "374708fff7719dd5979ec875d56cd2286f6d3cf7ec317a3b25632aab28ec37bb"
        );
    }

    #[test]
    fn test_blind_sign_round_trip() {
        let private_key = test_rsa_key();
        let public_key = private_key.to_public_key();

        let h_n = hash(&[0u8; NONCE_LENGTH]);
        let ctx = blind(&h_n, &public_key).unwrap();
        assert_eq!(ctx.blinded_message.len(), 256);
        assert_eq!(ctx.original_hash, h_n);

        let blind_sig = blind_sign(&ctx.blinded_message);
        let sig = unblind(&blind_sig, &ctx.secret, &ctx.randomizer, &h_n, &public_key).unwrap();
        assert_eq!(sig.len(), 256);

        assert!(verify(&sig, &ctx.randomizer, &h_n, &public_key));
    }

    #[test]
    fn test_blind_signature_matches_its_request() {
        let public_key = test_rsa_key().to_public_key();
        let h_n = hash(&generate_nonce().unwrap());
        let current = blind(&h_n, &public_key).unwrap();
        let earlier = blind(&h_n, &public_key).unwrap();

        let reply = blind_sign(&current.blinded_message);
        assert!(signs_blinded(&reply, &current.blinded_message, &public_key));

        let late_reply = blind_sign(&earlier.blinded_message);
        assert!(!signs_blinded(&late_reply, &current.blinded_message, &public_key));

        assert!(!signs_blinded(&[0x5a; 256], &current.blinded_message, &public_key));
        assert!(!signs_blinded(&[0xff; 257], &current.blinded_message, &public_key));
    }

    #[test]
    fn test_blinding_is_randomized() {
        let public_key = test_rsa_key().to_public_key();
        let h_n = hash(&generate_nonce().unwrap());

        let first = blind(&h_n, &public_key).unwrap();
        let second = blind(&h_n, &public_key).unwrap();

        assert_ne!(first.blinded_message, second.blinded_message);
        assert_ne!(first.secret, second.secret);
        assert_ne!(first.randomizer, second.randomizer);
    }

    #[test]
    fn test_tamper_rejection() {
        let public_key = test_rsa_key().to_public_key();
        let h_n = hash(&generate_nonce().unwrap());
        let ctx = blind(&h_n, &public_key).unwrap();
        let sig = unblind(
            &blind_sign(&ctx.blinded_message),
            &ctx.secret,
            &ctx.randomizer,
            &h_n,
            &public_key,
        )
        .unwrap();

        for i in 0..sig.len() {
            let mut tampered = sig.clone();
            tampered[i] ^= 0x01;
            assert!(
                !verify(&tampered, &ctx.randomizer, &h_n, &public_key),
                "flipped byte {} still verified",
                i
            );
        }

        // Wrong message
        let other = hash(b"some other nonce");
        assert!(!verify(&sig, &ctx.randomizer, &other, &public_key));

        // Wrong randomizer
        let mut randomizer = ctx.randomizer;
        randomizer[0] ^= 0xff;
        assert!(!verify(&sig, &randomizer, &h_n, &public_key));

        // Missing randomizer
        assert!(!verify(&sig, &[], &h_n, &public_key));
    }

    #[test]
    fn test_unblind_rejects_inconsistent_inputs() {
        let public_key = test_rsa_key().to_public_key();
        let h_n = hash(&generate_nonce().unwrap());
        let ctx = blind(&h_n, &public_key).unwrap();
        let blind_sig = blind_sign(&ctx.blinded_message);

        assert!(matches!(
            unblind(&blind_sig, &ctx.secret, &[], &h_n, &public_key),
            Err(CryptoError::MissingRandomizer)
        ));
        assert!(matches!(
            unblind(&blind_sig, &ctx.secret, &ctx.randomizer[..16], &h_n, &public_key),
            Err(CryptoError::InvalidLength { .. })
        ));
        assert!(matches!(
            unblind(&blind_sig, &ctx.secret, &ctx.randomizer, &h_n[..31], &public_key),
            Err(CryptoError::InvalidLength { .. })
        ));

        let mut too_long = blind_sig.clone();
        too_long.push(0);
        assert!(unblind(&too_long, &ctx.secret, &ctx.randomizer, &h_n, &public_key).is_err());

        // Wrong coordinator key
        let other_key = other_rsa_key().to_public_key();
        assert!(unblind(&blind_sig, &ctx.secret, &ctx.randomizer, &h_n, &other_key).is_err());

        // Randomizer that was not used for blinding
        let mut randomizer = ctx.randomizer;
        randomizer[31] ^= 0x80;
        assert!(matches!(
            unblind(&blind_sig, &ctx.secret, &randomizer, &h_n, &public_key),
            Err(CryptoError::VerificationFailed)
        ));
    }
}
