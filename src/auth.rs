//! Login authentication methods
//!
//! RFC 3720 Section 8.2 - CHAP Algorithm, RFC 1994 for the response hash.
//! The login state machine offers every configured [`Authenticator`] by
//! identifier and then drives the one the target selects.

use crate::error::{IscsiError, ScsiResult};
use crate::text::TextBuffer;
use rand::Rng;
use std::fmt;

/// An identity-proof step run during security negotiation
pub trait Authenticator: fmt::Debug {
    /// Value offered in `AuthMethod=`
    fn identifier(&self) -> &'static str;

    /// Produce the keys for the next Login Request of the security phase
    fn get_parameters(&mut self, out: &mut TextBuffer);

    /// Consume the keys from the target's latest Login Response
    fn set_parameters(&mut self, incoming: &TextBuffer) -> ScsiResult<()>;

    /// Whether both sides have proven what this method requires
    fn is_complete(&self) -> bool;
}

/// `AuthMethod=None`: no keys exchanged
#[derive(Debug, Clone, Default)]
pub struct NullAuthenticator;

impl Authenticator for NullAuthenticator {
    fn identifier(&self) -> &'static str {
        "None"
    }

    fn get_parameters(&mut self, _out: &mut TextBuffer) {}

    fn set_parameters(&mut self, _incoming: &TextBuffer) -> ScsiResult<()> {
        Ok(())
    }

    fn is_complete(&self) -> bool {
        true
    }
}

/// CHAP algorithm identifier (RFC 1994)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapAlgorithm {
    /// MD5 algorithm (algorithm identifier 5)
    Md5 = 5,
}

impl ChapAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "5" => Some(ChapAlgorithm::Md5),
            _ => None,
        }
    }
}

/// CHAP credentials for authentication
#[derive(Debug, Clone)]
pub struct ChapCredentials {
    /// Username for CHAP authentication
    pub username: String,
    /// Secret/password for CHAP authentication
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Response = MD5(identifier + secret + challenge)
pub fn chap_response(identifier: u8, secret: &str, challenge: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + secret.len() + challenge.len());
    data.push(identifier);
    data.extend_from_slice(secret.as_bytes());
    data.extend_from_slice(challenge);

    md5::compute(&data).0.to_vec()
}

/// Encode binary CHAP values as `0x`-prefixed hex
pub fn encode_chap_binary(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a `0x`-prefixed hex CHAP value
pub fn decode_chap_binary(value: &str) -> ScsiResult<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| {
            IscsiError::Auth(format!("Unsupported CHAP binary encoding: {}", value))
        })?;
    hex::decode(digits).map_err(|e| IscsiError::Auth(format!("Invalid CHAP hex value: {}", e)))
}

/// Challenge we issue to the target for mutual CHAP
#[derive(Debug, Clone)]
struct ChapChallenge {
    identifier: u8,
    challenge: Vec<u8>,
}

impl ChapChallenge {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        let identifier = rng.gen::<u8>();
        let mut challenge = vec![0u8; 16];
        rng.fill(&mut challenge[..]);

        Self {
            identifier,
            challenge,
        }
    }

    fn validate_response(&self, response: &[u8], secret: &str) -> bool {
        let expected = chap_response(self.identifier, secret, &self.challenge);

        if response.len() != expected.len() {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in response.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }

        diff == 0
    }
}

#[derive(Debug, Clone)]
enum ChapState {
    SendAlgorithm,
    ReceiveChallenge,
    SendResponse { identifier: u8, challenge: Vec<u8> },
    ReceiveTargetResponse(ChapChallenge),
    Finished,
}

/// `AuthMethod=CHAP`, optionally mutual
#[derive(Debug, Clone)]
pub struct ChapAuthenticator {
    credentials: ChapCredentials,
    /// Credentials the target must prove for mutual CHAP
    target_credentials: Option<ChapCredentials>,
    state: ChapState,
}

impl ChapAuthenticator {
    pub fn new(credentials: ChapCredentials) -> Self {
        Self {
            credentials,
            target_credentials: None,
            state: ChapState::SendAlgorithm,
        }
    }

    pub fn mutual(credentials: ChapCredentials, target_credentials: ChapCredentials) -> Self {
        Self {
            credentials,
            target_credentials: Some(target_credentials),
            state: ChapState::SendAlgorithm,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ChapState::Finished)
    }
}

fn required<'a>(incoming: &'a TextBuffer, key: &str) -> ScsiResult<&'a str> {
    incoming
        .get(key)
        .ok_or_else(|| IscsiError::Auth(format!("Target did not send {}", key)))
}

impl Authenticator for ChapAuthenticator {
    fn identifier(&self) -> &'static str {
        "CHAP"
    }

    fn get_parameters(&mut self, out: &mut TextBuffer) {
        match std::mem::replace(&mut self.state, ChapState::Finished) {
            ChapState::SendAlgorithm => {
                out.add("CHAP_A", &(ChapAlgorithm::Md5 as u8).to_string());
                self.state = ChapState::ReceiveChallenge;
            }
            ChapState::SendResponse {
                identifier,
                challenge,
            } => {
                let response = chap_response(identifier, &self.credentials.secret, &challenge);
                out.add("CHAP_N", &self.credentials.username);
                out.add("CHAP_R", &encode_chap_binary(&response));

                self.state = match self.target_credentials {
                    Some(_) => {
                        let ours = ChapChallenge::new();
                        out.add("CHAP_I", &ours.identifier.to_string());
                        out.add("CHAP_C", &encode_chap_binary(&ours.challenge));
                        ChapState::ReceiveTargetResponse(ours)
                    }
                    None => ChapState::Finished,
                };
            }
            other => self.state = other,
        }
    }

    fn set_parameters(&mut self, incoming: &TextBuffer) -> ScsiResult<()> {
        match &self.state {
            ChapState::ReceiveChallenge => {
                let algorithm = required(incoming, "CHAP_A")?;
                if ChapAlgorithm::from_str(algorithm).is_none() {
                    return Err(IscsiError::Auth(format!(
                        "Unsupported CHAP algorithm: {}",
                        algorithm
                    )));
                }

                let identifier = required(incoming, "CHAP_I")?
                    .parse::<u8>()
                    .map_err(|_| IscsiError::Auth("Invalid CHAP_I value".to_string()))?;
                let challenge = decode_chap_binary(required(incoming, "CHAP_C")?)?;
                if challenge.is_empty() {
                    return Err(IscsiError::Auth("Empty CHAP challenge".to_string()));
                }

                log::debug!(
                    "CHAP challenge received: id={} ({} bytes)",
                    identifier,
                    challenge.len()
                );
                self.state = ChapState::SendResponse {
                    identifier,
                    challenge,
                };
            }
            ChapState::ReceiveTargetResponse(ours) => {
                let expected = match &self.target_credentials {
                    Some(creds) => creds,
                    None => return Ok(()),
                };

                let name = required(incoming, "CHAP_N")?;
                if name != expected.username {
                    return Err(IscsiError::Auth(format!(
                        "Target identified as '{}', expected '{}'",
                        name, expected.username
                    )));
                }

                let response = decode_chap_binary(required(incoming, "CHAP_R")?)?;
                if !ours.validate_response(&response, &expected.secret) {
                    return Err(IscsiError::Auth(
                        "Target failed mutual CHAP authentication".to_string(),
                    ));
                }

                log::debug!("Target passed mutual CHAP authentication");
                self.state = ChapState::Finished;
            }
            _ => {}
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.is_finished()
    }
}
