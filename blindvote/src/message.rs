use crate::*;
use num_enum::TryFromPrimitive;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::convert::TryFrom;

/// Upper bound on the size of a JSON message accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A protocol message exchanged with the coordinator
///
/// `id` is the election id. Token and Vote payloads are base64; Error payloads
/// are base64 or plain text.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub payload: String,
}

/// Message kind, as carried on the wire
#[derive(TryFromPrimitive, Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Token = 1,
    Vote = 2,
    Error = 3,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            MessageKind::Token => "token",
            MessageKind::Vote => "vote",
            MessageKind::Error => "error",
        };
        write!(f, "{}", name)
    }
}

impl Serialize for MessageKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl Message {
    /// Token request carrying the blinded message
    pub fn token(election_id: &str, blinded_message: &[u8]) -> Self {
        Message {
            id: election_id.to_owned(),
            kind: MessageKind::Token,
            payload: base64::encode(blinded_message),
        }
    }

    /// Vote carrying an already composed vote payload
    pub fn vote(election_id: &str, payload: &VotePayload) -> Self {
        Message {
            id: election_id.to_owned(),
            kind: MessageKind::Vote,
            payload: payload.to_string(),
        }
    }

    pub fn error(election_id: &str, error: &ProtocolError) -> Self {
        Message {
            id: election_id.to_owned(),
            kind: MessageKind::Error,
            payload: error.code().to_owned(),
        }
    }

    /// Decode and validate a wire message
    ///
    /// Checks run in a fixed order: all keys present, primitive types, known
    /// kind, then payload encoding for the kind. The first failure wins.
    pub fn decode(json: &str) -> Result<Self, ValidationError> {
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge(json.len()));
        }

        let value: Value = serde_json::from_str(json).map_err(|_| ValidationError::MalformedJson)?;
        let object = value.as_object().ok_or(ValidationError::MalformedJson)?;

        let id = field(object, "id")?;
        let kind = field(object, "kind")?;
        let payload = field(object, "payload")?;

        let id = id.as_str().ok_or(ValidationError::WrongType("id"))?;
        let kind = kind.as_i64().ok_or(ValidationError::WrongType("kind"))?;
        let payload = payload.as_str().ok_or(ValidationError::WrongType("payload"))?;

        let kind = u8::try_from(kind)
            .ok()
            .and_then(|k| MessageKind::try_from_primitive(k).ok())
            .ok_or(ValidationError::UnknownKind(kind))?;

        match kind {
            MessageKind::Token | MessageKind::Vote => {
                if kind == MessageKind::Token && base64::decode(payload).is_err() {
                    return Err(ValidationError::BadPayloadEncoding(kind));
                }
                if kind == MessageKind::Vote && VotePayload::parse(payload).is_err() {
                    return Err(ValidationError::BadPayloadEncoding(kind));
                }
            }
            // Either encoding is acceptable, see `error_text`
            MessageKind::Error => {}
        }

        Ok(Message {
            id: id.to_owned(),
            kind,
            payload: payload.to_owned(),
        })
    }

    /// Encode as wire JSON
    pub fn to_json(&self) -> String {
        // Three string/number fields cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Raw payload bytes of a Token message
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        base64::decode(&self.payload).map_err(|_| ValidationError::BadPayloadEncoding(self.kind))
    }

    /// Text of an Error message: base64 is tried first, then the raw payload
    pub fn error_text(&self) -> String {
        base64::decode(&self.payload)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| self.payload.clone())
    }
}

fn field<'a>(object: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, ValidationError> {
    object.get(name).ok_or(ValidationError::MissingField(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kinds() {
        assert!(MessageKind::Token as u8 == 1);
        assert!(MessageKind::Vote as u8 == 2);
        assert!(MessageKind::Error as u8 == 3);
    }

    #[test]
    fn test_decode_token() {
        let msg = Message::decode(r#"{"id":"election-1","kind":1,"payload":"AAECAw=="}"#).unwrap();
        assert_eq!(msg.id, "election-1");
        assert_eq!(msg.kind, MessageKind::Token);
        assert_eq!(msg.payload_bytes().unwrap(), vec![0, 1, 2, 3]);

        let encoded = Message::token("election-1", &[0, 1, 2, 3]).to_json();
        assert_eq!(encoded, r#"{"id":"election-1","kind":1,"payload":"AAECAw=="}"#);
    }

    #[test]
    fn test_decode_validation_order() {
        assert_eq!(Message::decode("not json"), Err(ValidationError::MalformedJson));
        assert_eq!(Message::decode("[1,2,3]"), Err(ValidationError::MalformedJson));

        // Missing fields are reported before bad types
        assert_eq!(
            Message::decode(r#"{"id":7,"kind":1}"#),
            Err(ValidationError::MissingField("payload"))
        );
        assert_eq!(
            Message::decode(r#"{"kind":"1","payload":"AA=="}"#),
            Err(ValidationError::MissingField("id"))
        );

        assert_eq!(
            Message::decode(r#"{"id":7,"kind":1,"payload":"AA=="}"#),
            Err(ValidationError::WrongType("id"))
        );
        assert_eq!(
            Message::decode(r#"{"id":"e","kind":"1","payload":"AA=="}"#),
            Err(ValidationError::WrongType("kind"))
        );
        assert_eq!(
            Message::decode(r#"{"id":"e","kind":1,"payload":null}"#),
            Err(ValidationError::WrongType("payload"))
        );

        // Unknown kinds are reported before the payload is looked at
        assert_eq!(
            Message::decode(r#"{"id":"e","kind":9,"payload":"%%%"}"#),
            Err(ValidationError::UnknownKind(9))
        );
        assert_eq!(
            Message::decode(r#"{"id":"e","kind":-1,"payload":"AA=="}"#),
            Err(ValidationError::UnknownKind(-1))
        );

        assert_eq!(
            Message::decode(r#"{"id":"e","kind":1,"payload":"not base64!"}"#),
            Err(ValidationError::BadPayloadEncoding(MessageKind::Token))
        );
        assert_eq!(
            Message::decode(r#"{"id":"e","kind":2,"payload":"AA=="}"#),
            Err(ValidationError::BadPayloadEncoding(MessageKind::Vote))
        );
    }

    #[test]
    fn test_decode_too_large() {
        let payload = "A".repeat(MAX_MESSAGE_SIZE);
        let json = format!(r#"{{"id":"e","kind":1,"payload":"{}"}}"#, payload);
        assert_eq!(Message::decode(&json), Err(ValidationError::TooLarge(json.len())));
    }

    #[test]
    fn test_error_payloads() {
        let plain = Message::decode(r#"{"id":"e","kind":3,"payload":"election-closed"}"#).unwrap();
        assert_eq!(plain.error_text(), "election-closed");

        let encoded = base64::encode("unauthorized-voter");
        let json = format!(r#"{{"id":"e","kind":3,"payload":"{}"}}"#, encoded);
        let b64 = Message::decode(&json).unwrap();
        assert_eq!(b64.error_text(), "unauthorized-voter");

        let msg = Message::error("e", &ProtocolError::NonceHashAlreadyIssued);
        assert_eq!(msg.error_text(), "nonce-hash-already-issued");
    }
}
