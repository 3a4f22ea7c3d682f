//! Challenge/response login over the shared password
//!
//! The server hands out a random challenge; the client proves knowledge of the
//! password with HMAC-SHA256(password, challenge || session id). Binding the
//! session id keeps a response from being replayed on another session.

use crate::frame::SessionId;
use rand::RngCore;
use ring::hmac;

/// Challenge length in bytes
pub const CHALLENGE_LEN: usize = 16;

/// HMAC-SHA256 output length
pub const RESPONSE_LEN: usize = 32;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Draw a fresh challenge
pub fn new_challenge<R: RngCore>(rng: &mut R) -> Challenge {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rng.fill_bytes(&mut challenge);
    challenge
}

/// Keyed signer/verifier for login responses
pub struct Authenticator {
    key: hmac::Key,
}

impl Authenticator {
    pub fn new(password: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, password),
        }
    }

    fn message(challenge: &Challenge, session: SessionId) -> [u8; CHALLENGE_LEN + 1] {
        let mut msg = [0u8; CHALLENGE_LEN + 1];
        msg[..CHALLENGE_LEN].copy_from_slice(challenge);
        msg[CHALLENGE_LEN] = session;
        msg
    }

    pub fn respond(&self, challenge: &Challenge, session: SessionId) -> Vec<u8> {
        hmac::sign(&self.key, &Self::message(challenge, session))
            .as_ref()
            .to_vec()
    }

    /// Constant-time check of a client's response
    pub fn verify(&self, challenge: &Challenge, session: SessionId, response: &[u8]) -> bool {
        hmac::verify(&self.key, &Self::message(challenge, session), response).is_ok()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Authenticator { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_response_verifies() {
        let mut rng = StdRng::seed_from_u64(7);
        let challenge = new_challenge(&mut rng);
        let auth = Authenticator::new(b"hunter2");

        let response = auth.respond(&challenge, 12);
        assert_eq!(response.len(), RESPONSE_LEN);
        assert!(auth.verify(&challenge, 12, &response));
    }

    #[test]
    fn test_wrong_password_session_or_challenge_fails() {
        let mut rng = StdRng::seed_from_u64(7);
        let challenge = new_challenge(&mut rng);
        let other = new_challenge(&mut rng);
        assert_ne!(challenge, other);

        let server = Authenticator::new(b"hunter2");
        let client = Authenticator::new(b"hunter3");

        assert!(!server.verify(&challenge, 12, &client.respond(&challenge, 12)));
        assert!(!server.verify(&challenge, 13, &server.respond(&challenge, 12)));
        assert!(!server.verify(&other, 12, &server.respond(&challenge, 12)));
        assert!(!server.verify(&challenge, 12, &[]));
    }
}
