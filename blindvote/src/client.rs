//! The voter-side protocol driver.
//!
//! One election at a time goes through token request, unblinding and vote
//! casting. The session state machine decides what an inbound message may
//! do; this module only routes messages to it and reports the outcome.

use crate::*;
use ed25519_dalek::PublicKey;
use rsa::RSAPublicKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

// Abandoned token requests remembered for recognizing late replies
const ABANDONED_REQUEST_CAPACITY: usize = 8;

/// Outcome of a token request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenRequest {
    /// A new blinded request went out
    Sent,

    /// A valid token for this election is already held
    AlreadyIssued,
}

/// Protocol outcomes, broadcast to every interested consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    TokenIssued { election_id: String },
    TokenTimedOut { election_id: String },
    VoteCast { election_id: String, candidate_id: u32 },
    CoordinatorError { election_id: String, error: ProtocolError },
}

/// Drives the blind-signature protocol for one voter
pub struct VoterClient<R: Relay, S: SecureStorage> {
    session: SessionStore<S>,
    transport: EnvelopeTransport,
    dispatcher: Mutex<MessageDispatcher>,
    subscriptions: Arc<SubscriptionManager<R>>,
    inbound_tx: mpsc::UnboundedSender<Event>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    events: broadcast::Sender<ProtocolEvent>,
    listener: Mutex<Option<HandlerId>>,

    // Envelope address of the coordinator of each election asked for a token
    coordinators: Mutex<HashMap<String, PublicKey>>,
    pinned_coordinator: Option<PublicKey>,
    token_timeout: Duration,

    // Held from the single-flight check until the request is sent
    request_lock: Mutex<()>,
    abandoned: Mutex<VecDeque<AbandonedRequest>>,
}

/// A token request whose session ended before the coordinator answered
struct AbandonedRequest {
    election_id: String,
    blinded_message: Vec<u8>,
    coordinator_key: RSAPublicKey,
}

impl<R: Relay, S: SecureStorage> VoterClient<R, S> {
    pub fn new(
        config: &Config,
        storage: S,
        subscriptions: Arc<SubscriptionManager<R>>,
    ) -> Result<Self, Error> {
        let transport =
            EnvelopeTransport::new(config.identity()?).with_max_rumor_age(config.max_rumor_age);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(VoterClient {
            session: SessionStore::new(storage),
            transport,
            dispatcher: Mutex::new(MessageDispatcher::new(config.dedup_capacity)),
            subscriptions,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            events,
            listener: Mutex::new(None),
            coordinators: Mutex::new(HashMap::new()),
            pinned_coordinator: config.coordinator_public_key,
            token_timeout: config.token_timeout,
            request_lock: Mutex::new(()),
            abandoned: Mutex::new(VecDeque::new()),
        })
    }

    pub fn identity(&self) -> &Identity {
        self.transport.identity()
    }

    pub fn session(&self) -> &SessionStore<S> {
        &self.session
    }

    /// Subscribe to protocol outcomes
    pub fn events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    /// Listen for envelopes addressed to the voter
    ///
    /// Matching events are queued for `await_token`. Calling this again
    /// returns the existing handler id.
    pub async fn listen(&self) -> Result<HandlerId, Error> {
        let mut listener = self.listener.lock().await;
        if let Some(handler_id) = *listener {
            return Ok(handler_id);
        }

        let filter = Filter::new()
            .kind(KIND_GIFT_WRAP)
            .tag("p", &self.identity().public_hex());
        let inbound = self.inbound_tx.clone();
        let handler_id = self
            .subscriptions
            .subscribe(filter, move |event: &Event| {
                inbound
                    .send(event.clone())
                    .map_err(|_| "voter client is gone".to_owned())
            })
            .await?;

        *listener = Some(handler_id);
        Ok(handler_id)
    }

    /// Ask the election's coordinator for a blind-signed token
    pub async fn request_token(&self, election: &Election) -> Result<TokenRequest, Error> {
        election.ensure_open(now())?;
        let coordinator = self.coordinator_of(election)?;

        let _in_flight = self.request_lock.lock().await;
        if self.holds_valid_token(election).await {
            info!(election = %election.id, "token already issued, not requesting again");
            return Ok(TokenRequest::AlreadyIssued);
        }

        // The answer must not arrive before anyone is listening for it
        self.listen().await?;

        let replaced = self.session.read().await.ok().flatten();

        let nonce = generate_nonce()?;
        let blinding = blind(&hash(&nonce), &election.rsa_pub_key)?;
        self.session
            .start(&election.id, nonce, &blinding, &election.rsa_pub_key)
            .await?;

        if let Some(replaced) = replaced {
            if replaced.state() == SessionState::Initiated {
                self.abandon(&replaced).await;
            }
        }

        let message = Message::token(&election.id, &blinding.blinded_message);
        if let Err(e) = self.send(&coordinator, &message).await {
            if let Ok(Some(session)) = self.session.read().await {
                self.abandon(&session).await;
            }
            self.session.finish(SessionState::Errored).await?;
            return Err(e);
        }

        self.coordinators
            .lock()
            .await
            .insert(election.id.clone(), coordinator);
        info!(election = %election.id, "token requested");
        Ok(TokenRequest::Sent)
    }

    // The election author, which must be the configured coordinator if one is set
    fn coordinator_of(&self, election: &Election) -> Result<PublicKey, Error> {
        let coordinator = *election.coordinator()?;
        match self.pinned_coordinator {
            Some(pinned) if pinned != coordinator => Err(TransportError::UnexpectedSender(
                hex::encode(coordinator.as_bytes()),
            )
            .into()),
            _ => Ok(coordinator),
        }
    }

    /// Wait for the coordinator to answer the pending token request
    ///
    /// Inbound envelopes are handled as they arrive. Returns the session once
    /// the token is issued, the coordinator's error if one arrives for this
    /// election, or `Error::TokenTimeout` after clearing the session.
    pub async fn await_token(&self, election_id: &str) -> Result<Session, Error> {
        let mut inbound = self.inbound_rx.lock().await;
        let waiting = self.wait_for_token(election_id, &mut inbound);

        match tokio::time::timeout(self.token_timeout, waiting).await {
            Ok(result) => result,
            Err(_) => {
                self.time_out(election_id).await?;
                Err(Error::TokenTimeout(self.token_timeout.as_secs()))
            }
        }
    }

    /// Handle one inbound envelope: open, decode, deduplicate, apply
    ///
    /// Returns `Ok(None)` for envelopes that are dropped without effect:
    /// stale rumors, duplicates and messages a voter never acts on.
    pub async fn handle_event(&self, event: &Event) -> Result<Option<ProtocolEvent>, Error> {
        let opened = match self.transport.open(event)? {
            Some(opened) => opened,
            None => return Ok(None),
        };

        let message = Message::decode(&opened.rumor.content).map_err(|e| {
            warn!(envelope = %opened.envelope_id, error = %e, "dropping invalid message");
            e
        })?;

        let message = match self
            .dispatcher
            .lock()
            .await
            .dispatch(&opened.envelope_id, message, |m| m)
        {
            Some(message) => message,
            None => return Ok(None),
        };

        self.check_sender(&message, &opened.sender).await?;

        let outcome = match message.kind {
            MessageKind::Token => self.apply_token(&message).await?,
            MessageKind::Error => self.apply_error(&message, opened.rumor.created_at).await?,
            MessageKind::Vote => {
                debug!(election = %message.id, "ignoring vote addressed to voter");
                None
            }
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => return Ok(None),
        };

        let _ = self.events.send(outcome.clone());
        Ok(Some(outcome))
    }

    /// Cast a vote for `candidate_id` with the held token
    ///
    /// The token is verified locally first and nothing is sent if it fails.
    /// The vote envelope is sealed by a one-time identity.
    pub async fn cast_vote(&self, election: &Election, candidate_id: u32) -> Result<(), Error> {
        election.ensure_open(now())?;
        if election.candidate(candidate_id).is_none() {
            return Err(Error::UnknownCandidate(candidate_id));
        }
        let coordinator = self.coordinator_of(election)?;

        let session = self.session.read().await?.ok_or(SessionError::NoSession)?;
        if session.election_id != election.id {
            return Err(SessionError::ForeignElection {
                active: session.election_id,
                received: election.id.clone(),
            }
            .into());
        }

        let payload = session.vote_payload(candidate_id)?;
        if !payload.verify(&election.rsa_pub_key) {
            warn!(election = %election.id, "held token does not verify, vote not sent");
            return Err(CryptoError::VerificationFailed.into());
        }

        let message = Message::vote(&election.id, &payload);
        let envelope = self.transport.wrap_vote(&coordinator, &message)?;
        self.subscriptions.relay().publish(&envelope).await?;

        self.session.finish(SessionState::Cast).await?;
        self.coordinators.lock().await.remove(&election.id);
        self.abandoned
            .lock()
            .await
            .retain(|request| request.election_id != election.id);

        info!(election = %election.id, "vote cast");
        let _ = self.events.send(ProtocolEvent::VoteCast {
            election_id: election.id.clone(),
            candidate_id,
        });
        Ok(())
    }

    /// Stop listening for envelopes
    pub async fn shutdown(&self) -> Result<(), Error> {
        if let Some(handler_id) = self.listener.lock().await.take() {
            self.subscriptions.unsubscribe(handler_id).await?;
        }
        Ok(())
    }

    async fn send(&self, recipient: &PublicKey, message: &Message) -> Result<(), Error> {
        let envelope = self.transport.wrap(recipient, message)?;
        self.subscriptions.relay().publish(&envelope).await?;
        Ok(())
    }

    async fn holds_valid_token(&self, election: &Election) -> bool {
        let session = match self.session.read().await {
            Ok(Some(session)) => session,
            _ => return false,
        };
        if session.election_id != election.id || session.state() != SessionState::TokenIssued {
            return false;
        }
        if !self.session.validate().await {
            return false;
        }
        match session.vote_payload(0) {
            Ok(payload) => payload.verify(&election.rsa_pub_key),
            Err(_) => false,
        }
    }

    async fn issued_session(&self, election_id: &str) -> Result<Option<Session>, Error> {
        match self.session.read().await? {
            Some(session) if session.election_id == election_id => match session.state() {
                SessionState::TokenIssued => Ok(Some(session)),
                _ => Ok(None),
            },
            Some(session) => Err(SessionError::ForeignElection {
                active: session.election_id,
                received: election_id.to_owned(),
            }
            .into()),
            None => Err(SessionError::NoSession.into()),
        }
    }

    async fn wait_for_token(
        &self,
        election_id: &str,
        inbound: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<Session, Error> {
        loop {
            if let Some(session) = self.issued_session(election_id).await? {
                return Ok(session);
            }

            let event = inbound
                .recv()
                .await
                .ok_or_else(|| TransportError::Relay("inbound stream closed".into()))?;

            match self.handle_event(&event).await {
                Ok(Some(ProtocolEvent::CoordinatorError {
                    election_id: id,
                    error,
                })) if id == election_id => return Err(Error::Protocol(error)),
                Ok(_) => {}
                Err(Error::Crypto(e)) => return Err(Error::Crypto(e)),
                Err(e) => debug!(event = %event.id, error = %e, "dropped inbound event"),
            }
        }
    }

    async fn time_out(&self, election_id: &str) -> Result<(), Error> {
        if let Ok(Some(session)) = self.session.read().await {
            if session.election_id == election_id && session.state() == SessionState::Initiated {
                self.abandon(&session).await;
                self.session.finish(SessionState::TimedOut).await?;
            }
        }
        warn!(election = %election_id, secs = self.token_timeout.as_secs(), "token request timed out");
        let _ = self.events.send(ProtocolEvent::TokenTimedOut {
            election_id: election_id.to_owned(),
        });
        Ok(())
    }

    async fn check_sender(&self, message: &Message, sender: &PublicKey) -> Result<(), Error> {
        let coordinators = self.coordinators.lock().await;
        match coordinators.get(&message.id) {
            Some(expected) if expected == sender => Ok(()),
            Some(_) => {
                let sender = hex::encode(sender.as_bytes());
                warn!(election = %message.id, sender = %sender, "message from unexpected sender");
                Err(TransportError::UnexpectedSender(sender).into())
            }
            None => {
                debug!(election = %message.id, "message for an election with no pending request");
                Err(SessionError::NoSession.into())
            }
        }
    }

    async fn apply_token(&self, message: &Message) -> Result<Option<ProtocolEvent>, Error> {
        let session = self.session.read().await?.ok_or(SessionError::NoSession)?;
        if session.election_id != message.id {
            return Err(SessionError::ForeignElection {
                active: session.election_id,
                received: message.id.clone(),
            }
            .into());
        }
        if session.state() != SessionState::Initiated {
            return Err(SessionError::WrongState {
                expected: SessionState::Initiated,
                found: session.state(),
            }
            .into());
        }

        let blind_signature = message.payload_bytes()?;
        let answers_pending = signs_blinded(
            &blind_signature,
            &session.blinding.blinded_message,
            &session.coordinator_key,
        );
        if !answers_pending && self.answers_abandoned(&message.id, &blind_signature).await {
            debug!(election = %message.id, "dropping late reply to an abandoned token request");
            return Ok(None);
        }

        let signature = match unblind(
            &blind_signature,
            &session.blinding.secret,
            &session.blinding.randomizer,
            &session.hash_bytes,
            &session.coordinator_key,
        ) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(election = %message.id, error = %e, "coordinator signature unusable, session discarded");
                self.session.finish(SessionState::Errored).await?;
                return Err(e.into());
            }
        };

        self.session
            .complete_with_signature(&message.id, &signature, None)
            .await?;

        Ok(Some(ProtocolEvent::TokenIssued {
            election_id: message.id.clone(),
        }))
    }

    // Error replies carry nothing tying them to a request. One sent before
    // the pending request started, while an abandoned request is outstanding,
    // answers the abandoned one.
    async fn apply_error(
        &self,
        message: &Message,
        sent_at: u64,
    ) -> Result<Option<ProtocolEvent>, Error> {
        let error = ProtocolError::from_payload(&message.error_text());
        let session = self
            .session
            .read()
            .await?
            .filter(|session| session.election_id == message.id);

        if let Some(session) = &session {
            if sent_at < session.created_at && self.has_abandoned(&message.id).await {
                debug!(election = %message.id, code = %error.code(), "dropping error for an abandoned token request");
                return Ok(None);
            }
        }

        warn!(election = %message.id, code = %error.code(), "coordinator reported an error");
        if error.clears_session() && session.is_some() {
            self.session.finish(SessionState::Errored).await?;
        }

        Ok(Some(ProtocolEvent::CoordinatorError {
            election_id: message.id.clone(),
            error,
        }))
    }

    async fn abandon(&self, session: &Session) {
        let mut abandoned = self.abandoned.lock().await;
        if abandoned.len() == ABANDONED_REQUEST_CAPACITY {
            abandoned.pop_front();
        }
        abandoned.push_back(AbandonedRequest {
            election_id: session.election_id.clone(),
            blinded_message: session.blinding.blinded_message.clone(),
            coordinator_key: session.coordinator_key.clone(),
        });
    }

    async fn has_abandoned(&self, election_id: &str) -> bool {
        self.abandoned
            .lock()
            .await
            .iter()
            .any(|request| request.election_id == election_id)
    }

    async fn answers_abandoned(&self, election_id: &str, blind_signature: &[u8]) -> bool {
        self.abandoned.lock().await.iter().any(|request| {
            request.election_id == election_id
                && signs_blinded(blind_signature, &request.blinded_message, &request.coordinator_key)
        })
    }
}
