use crate::*;
use ed25519_dalek::{PublicKey, SecretKey};
use rsa::RSAPublicKey;
use std::fmt;

/// A candidate on the ballot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: u32,
    pub name: String,
}

/// Where an election is in its lifetime
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElectionStatus {
    Upcoming,
    Open,
    Finished,
}

impl fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ElectionStatus::Upcoming => "upcoming",
            ElectionStatus::Open => "open",
            ElectionStatus::Finished => "finished",
        };
        write!(f, "{}", name)
    }
}

/// An election as published by its coordinator
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Election {
    pub id: String,
    pub name: String,

    /// Unix seconds, voting opens at this instant
    pub start_time: u64,

    /// Unix seconds, voting is closed from this instant on
    pub end_time: u64,

    pub candidates: Vec<Candidate>,

    /// Key the coordinator blind-signs vote tokens with
    #[serde(with = "rsa_public_key_hex")]
    pub rsa_pub_key: RSAPublicKey,

    /// Envelope address of the coordinator, the author of the election event
    #[serde(skip)]
    pub coordinator: Option<PublicKey>,
}

impl Election {
    /// Parse and verify an election-definition event
    pub fn from_event(event: &Event) -> Result<Self, Error> {
        if event.kind != KIND_ELECTION {
            return Err(TransportError::UnexpectedKind(event.kind).into());
        }
        event.verify()?;

        let mut election: Election = serde_json::from_str(&event.content)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        election.coordinator = Some(event.author()?);
        Ok(election)
    }

    /// Publish this election as the coordinator `secret`
    pub fn to_event(&self, secret: &SecretKey, now: u64) -> Result<Event, Error> {
        let public: PublicKey = secret.into();
        let content =
            serde_json::to_string(self).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let tags = vec![vec!["d".to_owned(), self.id.clone()]];
        Ok(UnsignedEvent::new(&public, now, KIND_ELECTION, tags, content).sign(secret, &public))
    }

    pub fn status(&self, now: u64) -> ElectionStatus {
        if now < self.start_time {
            ElectionStatus::Upcoming
        } else if now < self.end_time {
            ElectionStatus::Open
        } else {
            ElectionStatus::Finished
        }
    }

    /// Fails unless the election is accepting tokens and votes at `now`
    pub fn ensure_open(&self, now: u64) -> Result<(), Error> {
        match self.status(now) {
            ElectionStatus::Open => Ok(()),
            _ => Err(Error::ElectionNotOpen(self.id.clone())),
        }
    }

    pub fn candidate(&self, id: u32) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// The coordinator's envelope address
    pub fn coordinator(&self) -> Result<&PublicKey, Error> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| Error::Config(format!("election {} has no coordinator", self.id)))
    }
}
