//! Server side of the password exchanges: cleartext, MD5 and SCRAM-SHA-256.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::messages::{
    BackendMessage, ProtocolError, decode_password_message, decode_sasl_initial_response,
};
use crate::protocol::sqlstate;
use crate::security::{AuthMethod, Credentials};

const SCRAM_MECHANISM: &str = "SCRAM-SHA-256";
const SCRAM_ITERATIONS: u32 = 4096;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password authentication failed for user \"{0}\"")]
    Failed(String),
    #[error("unsupported SASL mechanism {0}")]
    UnsupportedMechanism(String),
    #[error("{0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl AuthError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Self::Failed(_) => sqlstate::INVALID_PASSWORD,
            Self::UnsupportedMechanism(_) | Self::Malformed(_) | Self::Protocol(_) => {
                sqlstate::PROTOCOL_VIOLATION
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthStatus {
    /// Send this challenge and wait for the next password message.
    Continue(BackendMessage),
    /// Authentication succeeded; the optional message precedes AuthenticationOk.
    Authenticated(Option<BackendMessage>),
}

#[derive(Debug)]
struct ScramPending {
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    salt: [u8; 16],
}

#[derive(Debug)]
enum AuthState {
    Cleartext,
    Md5 { salt: [u8; 4] },
    ScramInitial,
    ScramFinal(ScramPending),
    Finished,
}

/// One in-progress login. Created from the resolved credentials; fed the
/// payload of every `p` message until it reports `Authenticated`.
#[derive(Debug)]
pub struct AuthExchange {
    user: String,
    password: String,
    state: AuthState,
}

impl AuthExchange {
    /// Returns `None` for trusted users, otherwise the exchange and its
    /// opening challenge.
    pub fn start(credentials: &Credentials) -> Option<(Self, BackendMessage)> {
        let password = credentials.password.clone()?;
        let (state, challenge) = match credentials.method {
            AuthMethod::Trust => return None,
            AuthMethod::Password => (
                AuthState::Cleartext,
                BackendMessage::AuthenticationCleartextPassword,
            ),
            AuthMethod::Md5 => {
                let mut salt = [0u8; 4];
                OsRng.fill_bytes(&mut salt);
                (
                    AuthState::Md5 { salt },
                    BackendMessage::AuthenticationMd5Password { salt },
                )
            }
            AuthMethod::ScramSha256 => (
                AuthState::ScramInitial,
                BackendMessage::AuthenticationSasl {
                    mechanisms: vec![SCRAM_MECHANISM.to_string()],
                },
            ),
        };
        Some((
            Self {
                user: credentials.user.clone(),
                password,
                state,
            },
            challenge,
        ))
    }

    pub fn respond(&mut self, payload: &[u8]) -> Result<AuthStatus, AuthError> {
        match std::mem::replace(&mut self.state, AuthState::Finished) {
            AuthState::Cleartext => {
                let supplied = decode_password_message(payload)?;
                self.verify(supplied == self.password)?;
                Ok(AuthStatus::Authenticated(None))
            }
            AuthState::Md5 { salt } => {
                let supplied = decode_password_message(payload)?;
                let expected = md5_password(&self.user, &self.password, &salt);
                self.verify(supplied == expected)?;
                Ok(AuthStatus::Authenticated(None))
            }
            AuthState::ScramInitial => {
                let (mechanism, data) = decode_sasl_initial_response(payload)?;
                if !mechanism.eq_ignore_ascii_case(SCRAM_MECHANISM) {
                    return Err(AuthError::UnsupportedMechanism(mechanism));
                }
                let pending = scram_server_first(&data)?;
                let challenge = BackendMessage::AuthenticationSaslContinue {
                    data: pending.server_first.clone().into_bytes(),
                };
                self.state = AuthState::ScramFinal(pending);
                Ok(AuthStatus::Continue(challenge))
            }
            AuthState::ScramFinal(pending) => {
                let server_final = scram_verify_final(&pending, &self.password, payload)
                    .ok_or_else(|| AuthError::Failed(self.user.clone()))?;
                Ok(AuthStatus::Authenticated(Some(
                    BackendMessage::AuthenticationSaslFinal {
                        data: server_final.into_bytes(),
                    },
                )))
            }
            AuthState::Finished => Err(AuthError::Malformed("authentication already finished")),
        }
    }

    fn verify(&self, ok: bool) -> Result<(), AuthError> {
        if ok {
            Ok(())
        } else {
            Err(AuthError::Failed(self.user.clone()))
        }
    }
}

/// `"md5" + md5_hex(md5_hex(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = hex(&Md5::digest(format!("{password}{user}").as_bytes()));
    let mut outer = Md5::new();
    outer.update(inner.as_bytes());
    outer.update(salt);
    format!("md5{}", hex(&outer.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn scram_server_first(data: &[u8]) -> Result<ScramPending, AuthError> {
    let client_first =
        std::str::from_utf8(data).map_err(|_| AuthError::Malformed("invalid SASL payload encoding"))?;
    let (_gs2, client_first_bare) = client_first
        .split_once(",,")
        .ok_or(AuthError::Malformed("invalid SCRAM client-first message"))?;
    let client_nonce = scram_attribute(client_first_bare, 'r')
        .filter(|nonce| !nonce.is_empty())
        .ok_or(AuthError::Malformed("SCRAM client-first message is missing nonce"))?;

    let mut random_nonce = [0u8; 18];
    OsRng.fill_bytes(&mut random_nonce);
    let combined_nonce = format!("{}{}", client_nonce, BASE64_STANDARD.encode(random_nonce));

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let server_first = format!(
        "r={},s={},i={}",
        combined_nonce,
        BASE64_STANDARD.encode(salt),
        SCRAM_ITERATIONS
    );
    Ok(ScramPending {
        client_first_bare: client_first_bare.to_string(),
        server_first,
        combined_nonce,
        salt,
    })
}

/// Checks the client proof; returns the server-final message on success.
fn scram_verify_final(pending: &ScramPending, password: &str, data: &[u8]) -> Option<String> {
    let client_final = std::str::from_utf8(data).ok()?;
    if scram_attribute(client_final, 'r')? != pending.combined_nonce {
        return None;
    }
    let (without_proof, _) = client_final.rsplit_once(",p=")?;
    let proof = BASE64_STANDARD
        .decode(scram_attribute(client_final, 'p')?)
        .ok()?;
    if proof.len() != 32 {
        return None;
    }

    let auth_message = format!(
        "{},{},{}",
        pending.client_first_bare, pending.server_first, without_proof
    );
    let salted_password =
        pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &pending.salt, SCRAM_ITERATIONS);
    let client_key = scram_hmac(&salted_password, b"Client Key")?;
    let stored_key = Sha256::digest(client_key);
    let client_signature = scram_hmac(stored_key.as_slice(), auth_message.as_bytes())?;
    let recovered_key: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(lhs, rhs)| lhs ^ rhs)
        .collect();
    if Sha256::digest(&recovered_key).as_slice() != stored_key.as_slice() {
        return None;
    }

    let server_key = scram_hmac(&salted_password, b"Server Key")?;
    let server_signature = scram_hmac(&server_key, auth_message.as_bytes())?;
    Some(format!("v={}", BASE64_STANDARD.encode(server_signature)))
}

fn scram_attribute(message: &str, key: char) -> Option<&str> {
    message.split(',').find_map(|part| {
        let (k, value) = part.split_once('=')?;
        (k.len() == 1 && k.starts_with(key)).then_some(value)
    })
}

fn scram_hmac(key: &[u8], data: &[u8]) -> Option<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).ok()?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(method: AuthMethod) -> Credentials {
        Credentials {
            user: "alice".to_string(),
            method,
            password: Some("wonder".to_string()),
        }
    }

    fn password_payload(password: &str) -> Vec<u8> {
        let mut payload = password.as_bytes().to_vec();
        payload.push(0);
        payload
    }

    #[test]
    fn trusted_users_skip_the_exchange() {
        assert!(AuthExchange::start(&Credentials::trusted("bob")).is_none());
    }

    #[test]
    fn cleartext_password_is_checked() {
        let (mut exchange, challenge) =
            AuthExchange::start(&credentials(AuthMethod::Password)).expect("challenge");
        assert_eq!(challenge, BackendMessage::AuthenticationCleartextPassword);
        assert_eq!(
            exchange.respond(&password_payload("wonder")).expect("accepted"),
            AuthStatus::Authenticated(None)
        );

        let (mut exchange, _) =
            AuthExchange::start(&credentials(AuthMethod::Password)).expect("challenge");
        let err = exchange
            .respond(&password_payload("guess"))
            .expect_err("wrong password");
        assert_eq!(err.sqlstate(), sqlstate::INVALID_PASSWORD);
    }

    #[test]
    fn md5_response_uses_issued_salt() {
        let (mut exchange, challenge) =
            AuthExchange::start(&credentials(AuthMethod::Md5)).expect("challenge");
        let BackendMessage::AuthenticationMd5Password { salt } = challenge else {
            panic!("expected md5 challenge");
        };
        let response = md5_password("alice", "wonder", &salt);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 35);
        assert_eq!(
            exchange.respond(&password_payload(&response)).expect("accepted"),
            AuthStatus::Authenticated(None)
        );
    }

    #[test]
    fn scram_exchange_round_trip() {
        let (mut exchange, challenge) =
            AuthExchange::start(&credentials(AuthMethod::ScramSha256)).expect("challenge");
        assert!(matches!(challenge, BackendMessage::AuthenticationSasl { .. }));

        let client_first_bare = "n=alice,r=clientnonce";
        let mut initial = b"SCRAM-SHA-256\0".to_vec();
        let first = format!("n,,{client_first_bare}");
        initial.extend_from_slice(&(first.len() as i32).to_be_bytes());
        initial.extend_from_slice(first.as_bytes());

        let AuthStatus::Continue(BackendMessage::AuthenticationSaslContinue { data }) =
            exchange.respond(&initial).expect("server first")
        else {
            panic!("expected SASL continue");
        };
        let server_first = String::from_utf8(data).expect("utf8");
        let nonce = scram_attribute(&server_first, 'r').expect("nonce");
        let salt = BASE64_STANDARD
            .decode(scram_attribute(&server_first, 's').expect("salt"))
            .expect("salt b64");
        assert!(nonce.starts_with("clientnonce"));

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let salted = pbkdf2_hmac_array::<Sha256, 32>(b"wonder", &salt, SCRAM_ITERATIONS);
        let client_key = scram_hmac(&salted, b"Client Key").expect("hmac");
        let stored_key = Sha256::digest(client_key);
        let signature = scram_hmac(&stored_key, auth_message.as_bytes()).expect("hmac");
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let client_final = format!("{without_proof},p={}", BASE64_STANDARD.encode(proof));

        let status = exchange
            .respond(client_final.as_bytes())
            .expect("proof accepted");
        assert!(matches!(
            status,
            AuthStatus::Authenticated(Some(BackendMessage::AuthenticationSaslFinal { .. }))
        ));
    }
}
