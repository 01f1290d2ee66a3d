use crate::*;
use std::fmt;
use std::str::FromStr;

/// The body of a kind 2 message: `base64(h_n):base64(token):base64(randomizer):candidate`
#[derive(Clone, PartialEq, Eq)]
pub struct VotePayload {
    pub hash: Vec<u8>,
    pub token: Vec<u8>,
    pub randomizer: Vec<u8>,
    pub candidate_id: u32,
}

impl VotePayload {
    pub fn new(hash: &[u8], token: &[u8], randomizer: &[u8], candidate_id: u32) -> Self {
        VotePayload {
            hash: hash.to_vec(),
            token: token.to_vec(),
            randomizer: randomizer.to_vec(),
            candidate_id,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(ValidationError::MalformedVotePayload("expected exactly four fields"));
        }

        let decode = |field: &str, name: &'static str| {
            if field.is_empty() {
                return Err(ValidationError::MalformedVotePayload(name));
            }
            base64::decode(field).map_err(|_| ValidationError::MalformedVotePayload(name))
        };

        let hash = decode(fields[0], "hash")?;
        let token = decode(fields[1], "token")?;
        let randomizer = decode(fields[2], "randomizer")?;

        // u32::from_str accepts a leading '+', the wire format does not
        if !fields[3].bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::MalformedVotePayload("candidate"));
        }
        let candidate_id = u32::from_str(fields[3])
            .map_err(|_| ValidationError::MalformedVotePayload("candidate"))?;

        Ok(VotePayload {
            hash,
            token,
            randomizer,
            candidate_id,
        })
    }

    /// Check the token against the coordinator key before it goes anywhere
    pub fn verify(&self, coordinator_key: &rsa::RSAPublicKey) -> bool {
        verify(&self.token, &self.randomizer, &self.hash, coordinator_key)
    }
}

impl fmt::Display for VotePayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            base64::encode(&self.hash),
            base64::encode(&self.token),
            base64::encode(&self.randomizer),
            self.candidate_id
        )
    }
}

impl fmt::Debug for VotePayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VotePayload")
            .field("hash", &hex::encode(&self.hash))
            .field("token_len", &self.token.len())
            .field("candidate_id", &self.candidate_id)
            .finish()
    }
}

impl FromStr for VotePayload {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VotePayload::parse(s)
    }
}
