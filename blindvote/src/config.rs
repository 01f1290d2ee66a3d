use crate::*;
use ed25519_dalek::{PublicKey, SecretKey};
use std::env::var;
use std::str::FromStr;
use std::time::Duration;

/// Voter client configuration
///
/// Every value has a default; `from_env` overrides them from `BLINDVOTE_*`
/// environment variables.
pub struct Config {
    /// Long-term voter key, freshly generated when not configured
    pub secret_key: SecretKey,

    /// Envelope address of the coordinator
    pub coordinator_public_key: Option<PublicKey>,

    pub token_timeout: Duration,
    pub max_rumor_age: Duration,
    pub dedup_capacity: usize,

    /// Relay URLs for the embedding application's websocket [`Relay`]
    /// implementation to connect to. The client itself only talks to the
    /// `Relay` it is handed.
    pub relays: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let (secret_key, _) = generate_keypair();
        Config {
            secret_key,
            coordinator_public_key: None,
            token_timeout: TOKEN_REQUEST_TIMEOUT,
            max_rumor_age: MAX_RUMOR_AGE,
            dedup_capacity: DEDUP_CAPACITY,
            relays: vec![],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| var(name).ok())
    }

    /// Build a config reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(val) = lookup("BLINDVOTE_SECRET_KEY") {
            let bytes = hex::decode(val.trim())
                .map_err(|e| Error::Config(format!("BLINDVOTE_SECRET_KEY: {}", e)))?;
            config.secret_key = SecretKey::from_bytes(&bytes)
                .map_err(|e| Error::Config(format!("BLINDVOTE_SECRET_KEY: {}", e)))?;
        }

        if let Some(val) = lookup("BLINDVOTE_COORDINATOR_PUBLIC_KEY") {
            let key = public_key_from_hex(&val)
                .map_err(|e| Error::Config(format!("BLINDVOTE_COORDINATOR_PUBLIC_KEY: {}", e)))?;
            config.coordinator_public_key = Some(key);
        }

        if let Some(secs) = parse_number(&lookup, "BLINDVOTE_TOKEN_TIMEOUT_SECS")? {
            config.token_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number(&lookup, "BLINDVOTE_MAX_RUMOR_AGE_SECS")? {
            config.max_rumor_age = Duration::from_secs(secs);
        }

        if let Some(capacity) = parse_number(&lookup, "BLINDVOTE_DEDUP_CAPACITY")? {
            if capacity == 0 {
                return Err(Error::Config("BLINDVOTE_DEDUP_CAPACITY must be positive".into()));
            }
            config.dedup_capacity = capacity as usize;
        }

        if let Some(val) = lookup("BLINDVOTE_RELAYS") {
            config.relays = val
                .split(',')
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .map(validate_relay_url)
                .collect::<Result<_, _>>()?;
        }

        Ok(config)
    }

    pub fn public_key(&self) -> PublicKey {
        (&self.secret_key).into()
    }

    /// The voter's long-term identity
    pub fn identity(&self) -> Result<Identity, Error> {
        // SecretKey is not Clone
        let secret = SecretKey::from_bytes(self.secret_key.as_bytes())
            .map_err(|e| Error::Config(format!("secret key: {}", e)))?;
        Ok(Identity::new(secret))
    }
}

fn parse_number<F>(lookup: &F, name: &str) -> Result<Option<u64>, Error>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(val) => u64::from_str(val.trim())
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", name, e))),
        None => Ok(None),
    }
}

/// Relay URLs must be websocket URLs with a host
fn validate_relay_url(url: &str) -> Result<String, Error> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or_else(|| Error::Config(format!("relay {} is not a ws:// or wss:// url", url)))?;

    let host = rest.split(|c| c == '/' || c == ':').next().unwrap_or("");
    if host.is_empty() {
        return Err(Error::Config(format!("relay {} has no host", url)));
    }
    Ok(url.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.token_timeout, Duration::from_secs(60));
        assert_eq!(config.max_rumor_age, Duration::from_secs(86_400));
        assert_eq!(config.dedup_capacity, 100);
        assert!(config.relays.is_empty());
        assert!(config.coordinator_public_key.is_none());
        assert_eq!(config.identity().unwrap().public_key(), &config.public_key());
    }

    #[test]
    fn test_overrides() {
        let (secret, public) = generate_keypair();
        let (_, coordinator) = generate_keypair();
        let secret_hex = hex::encode(secret.as_bytes());
        let coordinator_hex = hex::encode(coordinator.as_bytes());

        let config = config_from(&[
            ("BLINDVOTE_SECRET_KEY", secret_hex.as_str()),
            ("BLINDVOTE_COORDINATOR_PUBLIC_KEY", coordinator_hex.as_str()),
            ("BLINDVOTE_TOKEN_TIMEOUT_SECS", "5"),
            ("BLINDVOTE_MAX_RUMOR_AGE_SECS", "3600"),
            ("BLINDVOTE_DEDUP_CAPACITY", "10"),
            ("BLINDVOTE_RELAYS", "wss://relay.example.com, ws://localhost:7000/,"),
        ])
        .unwrap();

        assert_eq!(config.public_key(), public);
        assert_eq!(config.coordinator_public_key, Some(coordinator));
        assert_eq!(config.token_timeout, Duration::from_secs(5));
        assert_eq!(config.max_rumor_age, Duration::from_secs(3600));
        assert_eq!(config.dedup_capacity, 10);
        assert_eq!(
            config.relays,
            vec!["wss://relay.example.com", "ws://localhost:7000/"]
        );
    }

    #[test]
    fn test_invalid_values() {
        for &(name, value) in [
            ("BLINDVOTE_SECRET_KEY", "not hex"),
            ("BLINDVOTE_SECRET_KEY", "abcd"),
            ("BLINDVOTE_COORDINATOR_PUBLIC_KEY", "00"),
            ("BLINDVOTE_TOKEN_TIMEOUT_SECS", "-1"),
            ("BLINDVOTE_DEDUP_CAPACITY", "0"),
            ("BLINDVOTE_RELAYS", "https://relay.example.com"),
            ("BLINDVOTE_RELAYS", "wss://"),
        ]
        .iter()
        {
            assert!(
                matches!(config_from(&[(name, value)]), Err(Error::Config(_))),
                "{}={} should be rejected",
                name,
                value
            );
        }
    }
}
