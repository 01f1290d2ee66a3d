// Hex encodings for keys that travel inside JSON.
use ed25519_dalek::PublicKey;
use rsa::RSAPublicKey;
use serde::{de, Deserialize, Deserializer, Serializer};

/// RSA public keys are CBOR-serialized, then hex encoded
pub fn rsa_public_key_to_hex(key: &RSAPublicKey) -> Result<String, serde_cbor::Error> {
    Ok(hex::encode(serde_cbor::to_vec(key)?))
}

pub fn rsa_public_key_from_hex(s: &str) -> Result<RSAPublicKey, String> {
    let bytes = hex::decode(s.trim()).map_err(|e| format!("{}", e))?;
    serde_cbor::from_slice(&bytes).map_err(|e| format!("{}", e))
}

pub fn public_key_from_hex(s: &str) -> Result<PublicKey, String> {
    let bytes = hex::decode(s.trim()).map_err(|e| format!("{}", e))?;
    PublicKey::from_bytes(&bytes).map_err(|e| format!("{}", e))
}

// a single-purpose module for use in `#[serde(with)]`
pub mod rsa_public_key_hex {
    use super::*;

    pub fn serialize<S>(key: &RSAPublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = rsa_public_key_to_hex(key).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<RSAPublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        rsa_public_key_from_hex(&s).map_err(de::Error::custom)
    }
}
