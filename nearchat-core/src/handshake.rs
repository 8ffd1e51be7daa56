//! Challenge-response authentication run before any chat record is exchanged.
//!
//! Wire order: identifier line (initiator), challenge line (responder), response
//! line (initiator, base64 ciphertext of the challenge). Both machines are pure:
//! they consume incoming lines and return the line to send next. The host owns
//! the stream and the timeout.
//!
//! `HandshakeState` names the phase the exchange has reached and is shared by
//! both roles: the responder is in `IdSent` once the identifier arrived, in
//! `ChallengeReceived` once its challenge went out, and in `ResponseSent` while
//! it verifies the response.

use crate::cipher::{self, CryptoError};
use crate::identity::SessionKeys;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeState {
    NotStarted,
    IdSent,
    ChallengeReceived,
    ResponseSent,
    Authenticated,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Authenticated | HandshakeState::Failed)
    }
}

/// Which side of the exchange a session runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Malformed or out-of-order record.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty {0} line")]
    EmptyLine(&'static str),
    #[error("line contains a line terminator")]
    EmbeddedNewline,
    #[error("unexpected record in state {0:?}")]
    UnexpectedRecord(HandshakeState),
    #[error("challenge response does not match")]
    ChallengeMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result of a successful exchange.
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Identifier the initiator presented.
    pub peer_identifier: String,
    pub keys: SessionKeys,
}

fn check_line(line: &str, what: &'static str) -> Result<String, ProtocolError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.contains('\n') || line.contains('\r') {
        return Err(ProtocolError::EmbeddedNewline);
    }
    if line.trim().is_empty() {
        return Err(ProtocolError::EmptyLine(what));
    }
    Ok(line.to_string())
}

/// Connecting side: presents its identifier and answers the challenge.
#[derive(Debug)]
pub struct Initiator {
    identifier: String,
    state: HandshakeState,
    keys: Option<SessionKeys>,
}

impl Initiator {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: HandshakeState::NotStarted,
            keys: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// NotStarted → IdSent. Returns the identifier line.
    pub fn start(&mut self) -> Result<String, HandshakeError> {
        self.expect(HandshakeState::NotStarted)?;
        let line = check_line(&self.identifier, "identifier").map_err(|e| self.fail(e))?;
        self.state = HandshakeState::IdSent;
        Ok(line)
    }

    /// IdSent → ChallengeReceived → ResponseSent. Returns the response line.
    pub fn on_challenge(&mut self, line: &str) -> Result<String, HandshakeError> {
        self.expect(HandshakeState::IdSent)?;
        let challenge = check_line(line, "challenge").map_err(|e| self.fail(e))?;
        self.state = HandshakeState::ChallengeReceived;
        let keys = SessionKeys::from_identifier(&self.identifier);
        let response = match cipher::encrypt_text(&challenge, &keys) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        self.keys = Some(keys);
        self.state = HandshakeState::ResponseSent;
        Ok(response)
    }

    /// ResponseSent → Authenticated, once the response is flushed.
    ///
    /// The protocol carries no verdict: a responder that rejects the response
    /// closes the stream, which the initiator observes as a lost link.
    pub fn finish(&mut self) -> Result<SessionKeys, HandshakeError> {
        self.expect(HandshakeState::ResponseSent)?;
        match self.keys.clone() {
            Some(keys) => {
                self.state = HandshakeState::Authenticated;
                Ok(keys)
            }
            None => Err(self.fail(ProtocolError::UnexpectedRecord(self.state))),
        }
    }

    /// Mark the exchange failed (timeout or I/O error seen by the host).
    pub fn abort(&mut self) {
        if self.state != HandshakeState::Authenticated {
            self.state = HandshakeState::Failed;
        }
    }

    fn expect(&mut self, want: HandshakeState) -> Result<(), HandshakeError> {
        if self.state != want {
            let err = ProtocolError::UnexpectedRecord(self.state);
            return Err(self.fail(err));
        }
        Ok(())
    }

    fn fail(&mut self, err: impl Into<HandshakeError>) -> HandshakeError {
        self.state = HandshakeState::Failed;
        self.keys = None;
        err.into()
    }
}

/// Accepting side: issues the challenge and verifies the response.
#[derive(Debug)]
pub struct Responder {
    expected_identifier: Option<String>,
    challenge: String,
    state: HandshakeState,
    peer_identifier: Option<String>,
}

impl Responder {
    /// Fresh random challenge. With `expected_identifier`, keys are derived from
    /// it instead of the identifier the initiator presents.
    pub fn new(expected_identifier: Option<String>) -> Self {
        Self::with_challenge(expected_identifier, uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_challenge(
        expected_identifier: Option<String>,
        challenge: impl Into<String>,
    ) -> Self {
        Self {
            expected_identifier,
            challenge: challenge.into(),
            state: HandshakeState::NotStarted,
            peer_identifier: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer_identifier(&self) -> Option<&str> {
        self.peer_identifier.as_deref()
    }

    /// NotStarted → IdSent → ChallengeReceived. Returns the challenge line.
    pub fn on_identifier(&mut self, line: &str) -> Result<String, HandshakeError> {
        self.expect(HandshakeState::NotStarted)?;
        let identifier = check_line(line, "identifier").map_err(|e| self.fail(e))?;
        self.peer_identifier = Some(identifier);
        self.state = HandshakeState::IdSent;
        let challenge = check_line(&self.challenge, "challenge").map_err(|e| self.fail(e))?;
        self.state = HandshakeState::ChallengeReceived;
        Ok(challenge)
    }

    /// ChallengeReceived → ResponseSent → Authenticated | Failed.
    pub fn on_response(&mut self, line: &str) -> Result<Authenticated, HandshakeError> {
        self.expect(HandshakeState::ChallengeReceived)?;
        let response = check_line(line, "response").map_err(|e| self.fail(e))?;
        self.state = HandshakeState::ResponseSent;
        let peer_identifier = match self.peer_identifier.clone() {
            Some(id) => id,
            None => return Err(self.fail(ProtocolError::UnexpectedRecord(self.state))),
        };
        let seed = self
            .expected_identifier
            .clone()
            .unwrap_or_else(|| peer_identifier.clone());
        let keys = SessionKeys::from_identifier(&seed);
        let plain = match cipher::decrypt_text(&response, &keys) {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };
        if plain != self.challenge {
            return Err(self.fail(ProtocolError::ChallengeMismatch));
        }
        self.state = HandshakeState::Authenticated;
        Ok(Authenticated {
            peer_identifier,
            keys,
        })
    }

    pub fn abort(&mut self) {
        if self.state != HandshakeState::Authenticated {
            self.state = HandshakeState::Failed;
        }
    }

    fn expect(&mut self, want: HandshakeState) -> Result<(), HandshakeError> {
        if self.state != want {
            let err = ProtocolError::UnexpectedRecord(self.state);
            return Err(self.fail(err));
        }
        Ok(())
    }

    fn fail(&mut self, err: impl Into<HandshakeError>) -> HandshakeError {
        self.state = HandshakeState::Failed;
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Run = (Initiator, Responder, Result<Authenticated, HandshakeError>);

    fn run(initiator_id: &str, expected: Option<&str>) -> Run {
        let mut initiator = Initiator::new(initiator_id);
        let mut responder = Responder::new(expected.map(str::to_string));
        let id_line = initiator.start().unwrap();
        let challenge = responder.on_identifier(&id_line).unwrap();
        let response = initiator.on_challenge(&challenge).unwrap();
        let result = responder.on_response(&response);
        (initiator, responder, result)
    }

    #[test]
    fn same_identifier_authenticates() {
        let (mut initiator, responder, result) = run("816012345", Some("816012345"));
        let auth = result.unwrap();
        assert_eq!(auth.peer_identifier, "816012345");
        assert_eq!(responder.state(), HandshakeState::Authenticated);
        let keys = initiator.finish().unwrap();
        assert_eq!(keys, auth.keys);
        assert_eq!(initiator.state(), HandshakeState::Authenticated);
    }

    #[test]
    fn identifier_derived_from_presented_id_by_default() {
        let (_, responder, result) = run("816012345", None);
        assert!(result.is_ok());
        assert_eq!(responder.peer_identifier(), Some("816012345"));
    }

    #[test]
    fn different_identifier_fails() {
        let (_, responder, result) = run("816000000", Some("816012345"));
        assert!(result.is_err());
        assert_eq!(responder.state(), HandshakeState::Failed);
    }

    #[test]
    fn initiator_walks_states() {
        let mut initiator = Initiator::new("816012345");
        assert_eq!(initiator.state(), HandshakeState::NotStarted);
        assert_eq!(initiator.start().unwrap(), "816012345");
        assert_eq!(initiator.state(), HandshakeState::IdSent);
        let response = initiator.on_challenge("abc123").unwrap();
        assert_eq!(initiator.state(), HandshakeState::ResponseSent);
        let keys = SessionKeys::from_identifier("816012345");
        assert_eq!(cipher::decrypt_text(&response, &keys).unwrap(), "abc123");
    }

    #[test]
    fn garbage_response_fails_responder() {
        let mut responder = Responder::with_challenge(None, "abc123");
        assert_eq!(responder.on_identifier("816012345\n").unwrap(), "abc123");
        assert!(matches!(
            responder.on_response("%%% not base64"),
            Err(HandshakeError::Crypto(_))
        ));
        assert_eq!(responder.state(), HandshakeState::Failed);
    }

    #[test]
    fn failed_is_terminal() {
        let mut responder = Responder::with_challenge(None, "abc123");
        assert!(responder.on_identifier("").is_err());
        assert_eq!(responder.state(), HandshakeState::Failed);
        assert!(matches!(
            responder.on_identifier("816012345"),
            Err(HandshakeError::Protocol(ProtocolError::UnexpectedRecord(
                HandshakeState::Failed
            )))
        ));

        let mut initiator = Initiator::new("816012345");
        initiator.start().unwrap();
        initiator.abort();
        assert!(initiator.on_challenge("abc").is_err());
        assert!(initiator.finish().is_err());
        assert_eq!(initiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn out_of_order_record_fails() {
        let mut initiator = Initiator::new("816012345");
        assert!(initiator.on_challenge("abc").is_err());
        assert_eq!(initiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn challenges_are_unique() {
        let a = Responder::new(None);
        let b = Responder::new(None);
        assert_ne!(a.challenge, b.challenge);
    }
}
