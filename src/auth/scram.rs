//! SCRAM-SHA-256 authentication implementation
//!
//! Implements the client side of SCRAM-SHA-256 (RFC 5802 / RFC 7677) as Postgres uses it
//! for SASL authentication: no channel binding, GS2 header `n,,`.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name
pub const MECHANISM: &str = "SCRAM-SHA-256";

const GS2_HEADER: &str = "n,,";

fn invalid(what: &str) -> Error {
    Error::Authentication(format!("invalid SCRAM server message: {what}"))
}

/// Values kept between client-final and server-final
#[derive(Clone, Debug)]
pub struct ScramState {
    auth_message: Vec<u8>,
    server_key: Vec<u8>,
}

/// SCRAM-SHA-256 client
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("username", &self.username)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl ScramClient {
    /// Client with a fresh random nonce
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let nonce_bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
        Self::with_nonce(username, password, BASE64.encode(&nonce_bytes))
    }

    /// Client with a fixed nonce
    pub fn with_nonce(
        username: impl Into<String>,
        password: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nonce: nonce.into(),
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// client-first-message
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Process server-first-message; returns client-final-message and the state needed
    /// to verify the server's signature.
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramState)> {
        let (server_nonce, salt, iterations) = parse_server_first(server_first)?;

        if !server_nonce.starts_with(&self.nonce) || server_nonce.len() == self.nonce.len() {
            return Err(invalid("server nonce does not extend the client nonce"));
        }

        let salt = BASE64.decode(salt).map_err(|_| invalid("salt encoding"))?;
        let iterations = iterations
            .parse::<u32>()
            .ok()
            .filter(|&i| i > 0)
            .ok_or_else(|| invalid("iteration count"))?;

        let channel_binding = BASE64.encode(GS2_HEADER);
        let client_final_without_proof = format!("c={},r={}", channel_binding, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        // SaltedPassword := PBKDF2(password, salt, iterations, HMAC-SHA256)
        let mut salted_password = [0u8; 32];
        let _ = pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;

        // ClientProof := ClientKey XOR ClientSignature
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key")?;
        let client_final = format!("{},p={}", client_final_without_proof, BASE64.encode(proof));

        Ok((
            client_final,
            ScramState {
                auth_message: auth_message.into_bytes(),
                server_key,
            },
        ))
    }

    /// Verify server-final-message
    pub fn verify_server_final(&self, server_final: &str, state: &ScramState) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Authentication(format!("server rejected SCRAM: {err}")));
        }
        let encoded = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| invalid("missing server signature"))?;
        let server_signature = BASE64
            .decode(encoded)
            .map_err(|_| invalid("server signature encoding"))?;

        let expected = hmac(&state.server_key, &state.auth_message)?;
        if constant_time_compare(&server_signature, &expected) {
            Ok(())
        } else {
            Err(Error::Authentication(
                "server signature verification failed".into(),
            ))
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::Authentication("HMAC key error".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Parse server-first-message: r=<nonce>,s=<salt>,i=<iterations>
fn parse_server_first(msg: &str) -> Result<(&str, &str, &str)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value);
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value);
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(value);
        }
    }

    match (nonce, salt, iterations) {
        (Some(r), Some(s), Some(i)) if !r.is_empty() && !s.is_empty() && !i.is_empty() => {
            Ok((r, s, i))
        }
        _ => Err(invalid("missing required fields in server first message")),
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
