//! ECIES-ed25519: integrated encryption keyed by ed25519 identities.
//!
//! The recipient's ed25519 public key doubles as its encryption key: the
//! expanded ed25519 secret scalar is exactly the scalar behind the public
//! point, so an Edwards Diffie-Hellman against a fresh ephemeral key gives a
//! shared point only the recipient can recompute.
//!
//! Layout of a ciphertext: `ephemeral_pk (32) || iv (12) || aes-256-gcm(msg)`.

use aes_gcm::aead::{self, Aead, NewAead};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey, PUBLIC_KEY_LENGTH};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const AES_IV_LENGTH: usize = 12;
const AES_TAG_LENGTH: usize = 16;
const HKDF_INFO: &[u8] = b"blindvote-envelope-v1";

type AesKey = [u8; 32];
type SharedSecret = [u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EciesError {
    #[error("ecies: ciphertext too short")]
    TooShort,

    #[error("ecies: invalid public key")]
    InvalidPublicKey,

    #[error("ecies: decryption failed")]
    Decryption,

    #[error("ecies: encryption failed")]
    Encryption,
}

impl From<aead::Error> for EciesError {
    fn from(_: aead::Error) -> Self {
        EciesError::Decryption
    }
}

/// Encrypt a message so that only the holder of `receiver_pub`'s secret can read it
pub fn encrypt(receiver_pub: &PublicKey, msg: &[u8]) -> Result<Vec<u8>, EciesError> {
    let (ephemeral_sk, ephemeral_pk) = crate::generate_keypair();

    let aes_key = encapsulate(&ephemeral_sk, &ephemeral_pk, receiver_pub)?;
    let encrypted = aes_encrypt(&aes_key, msg)?;

    let mut cipher_text = Vec::with_capacity(PUBLIC_KEY_LENGTH + encrypted.len());
    cipher_text.extend_from_slice(ephemeral_pk.as_bytes());
    cipher_text.extend(encrypted);

    Ok(cipher_text)
}

/// Decrypt a ciphertext produced by `encrypt` with the receiver's secret key
pub fn decrypt(receiver_sec: &SecretKey, msg: &[u8]) -> Result<Vec<u8>, EciesError> {
    if msg.len() < PUBLIC_KEY_LENGTH + AES_IV_LENGTH + AES_TAG_LENGTH {
        return Err(EciesError::TooShort);
    }

    let ephemeral_pk =
        PublicKey::from_bytes(&msg[..PUBLIC_KEY_LENGTH]).map_err(|_| EciesError::InvalidPublicKey)?;
    let encrypted = &msg[PUBLIC_KEY_LENGTH..];
    let aes_key = decapsulate(receiver_sec, &ephemeral_pk)?;

    aes_decrypt(&aes_key, encrypted)
}

fn hkdf_sha256(master: &[u8]) -> AesKey {
    let h = Hkdf::<Sha256>::new(None, master);
    let mut out = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length
    let _ = h.expand(HKDF_INFO, &mut out);
    out
}

fn secret_scalar(secret: &SecretKey) -> Scalar {
    let expanded = ExpandedSecretKey::from(secret);
    let mut bits = [0u8; 32];
    bits.copy_from_slice(&expanded.to_bytes()[..32]);
    Scalar::from_bits(bits)
}

fn as_point(public: &PublicKey) -> Result<EdwardsPoint, EciesError> {
    CompressedEdwardsY(public.to_bytes())
        .decompress()
        .ok_or(EciesError::InvalidPublicKey)
}

fn generate_shared(secret: &SecretKey, public: &PublicKey) -> Result<SharedSecret, EciesError> {
    let shared_point = as_point(public)? * secret_scalar(secret);
    Ok(shared_point.compress().to_bytes())
}

fn encapsulate(
    ephemeral_sk: &SecretKey,
    ephemeral_pk: &PublicKey,
    peer_pk: &PublicKey,
) -> Result<AesKey, EciesError> {
    let shared_point = generate_shared(ephemeral_sk, peer_pk)?;

    let mut master = Vec::with_capacity(32 * 2);
    master.extend_from_slice(ephemeral_pk.as_bytes());
    master.extend_from_slice(&shared_point);
    Ok(hkdf_sha256(&master))
}

fn decapsulate(sk: &SecretKey, ephemeral_pk: &PublicKey) -> Result<AesKey, EciesError> {
    let shared_point = generate_shared(sk, ephemeral_pk)?;

    let mut master = Vec::with_capacity(32 * 2);
    master.extend_from_slice(ephemeral_pk.as_bytes());
    master.extend_from_slice(&shared_point);
    Ok(hkdf_sha256(&master))
}

fn aes_encrypt(key: &AesKey, msg: &[u8]) -> Result<Vec<u8>, EciesError> {
    let aead = Aes256Gcm::new(Key::from_slice(key));

    let mut iv = [0u8; AES_IV_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = aead
        .encrypt(Nonce::from_slice(&iv), msg)
        .map_err(|_| EciesError::Encryption)?;

    let mut output = Vec::with_capacity(AES_IV_LENGTH + ciphertext.len());
    output.extend_from_slice(&iv);
    output.extend(ciphertext);

    Ok(output)
}

fn aes_decrypt(key: &AesKey, ciphertext: &[u8]) -> Result<Vec<u8>, EciesError> {
    if ciphertext.len() < AES_IV_LENGTH + AES_TAG_LENGTH {
        return Err(EciesError::TooShort);
    }
    let aead = Aes256Gcm::new(Key::from_slice(key));

    let iv = Nonce::from_slice(&ciphertext[..AES_IV_LENGTH]);
    let encrypted = &ciphertext[AES_IV_LENGTH..];

    Ok(aead.decrypt(iv, encrypted)?)
}
