//! SASL mechanism negotiation and the SCRAM client side.
//!
//! Mechanism preference: SCRAM-SHA-512 > SCRAM-SHA-256 > SCRAM-SHA-1 >
//! PLAIN, and PLAIN is only acceptable over TLS. Authentication failures are
//! terminal for the connection; nothing here retries.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::Digest;
use hmac::{Mac, SimpleHmac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use reef_common::error::{HandshakeError, ReefError, ReefResult};

/// A SASL mechanism both sides can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha512,
    ScramSha256,
    ScramSha1,
    Plain,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::ScramSha512 => "SCRAM-SHA512",
            Mechanism::ScramSha256 => "SCRAM-SHA256",
            Mechanism::ScramSha1 => "SCRAM-SHA1",
            Mechanism::Plain => "PLAIN",
        }
    }
}

/// Choose the strongest mechanism from a server's space-separated list.
///
/// Returns `None` when nothing acceptable is offered (PLAIN without TLS is
/// not acceptable).
pub fn pick_mechanism(server_list: &str, tls: bool) -> Option<Mechanism> {
    let offered: Vec<&str> = server_list.split_whitespace().collect();
    for candidate in [
        Mechanism::ScramSha512,
        Mechanism::ScramSha256,
        Mechanism::ScramSha1,
    ] {
        if offered.iter().any(|m| *m == candidate.name()) {
            return Some(candidate);
        }
    }
    if tls && offered.iter().any(|m| *m == Mechanism::Plain.name()) {
        return Some(Mechanism::Plain);
    }
    None
}

/// The PLAIN initial response: `\0user\0password`.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + password.len() + 2);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}

// ── Digest dispatch ──────────────────────────────────────────────────────

fn hmac_parts<D>(key: &[u8], parts: &[&[u8]]) -> Vec<u8>
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut mac = <SimpleHmac<D> as Mac>::new_from_slice(key).expect("hmac accepts any key size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn hash_once<D: Digest>(data: &[u8]) -> Vec<u8> {
    D::digest(data).to_vec()
}

/// PBKDF2 with HMAC as the PRF, one block (all SCRAM hash sizes fit).
fn hi<D>(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut u = hmac_parts::<D>(password, &[salt, &1u32.to_be_bytes()]);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac_parts::<D>(password, &[&u]);
        for (r, b) in result.iter_mut().zip(&u) {
            *r ^= b;
        }
    }
    result
}

fn mech_hmac(mech: Mechanism, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    match mech {
        Mechanism::ScramSha512 => hmac_parts::<Sha512>(key, parts),
        Mechanism::ScramSha256 => hmac_parts::<Sha256>(key, parts),
        Mechanism::ScramSha1 => hmac_parts::<Sha1>(key, parts),
        Mechanism::Plain => unreachable!("PLAIN has no HMAC step"),
    }
}

fn mech_hash(mech: Mechanism, data: &[u8]) -> Vec<u8> {
    match mech {
        Mechanism::ScramSha512 => hash_once::<Sha512>(data),
        Mechanism::ScramSha256 => hash_once::<Sha256>(data),
        Mechanism::ScramSha1 => hash_once::<Sha1>(data),
        Mechanism::Plain => unreachable!("PLAIN has no hash step"),
    }
}

fn mech_hi(mech: Mechanism, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    match mech {
        Mechanism::ScramSha512 => hi::<Sha512>(password, salt, iterations),
        Mechanism::ScramSha256 => hi::<Sha256>(password, salt, iterations),
        Mechanism::ScramSha1 => hi::<Sha1>(password, salt, iterations),
        Mechanism::Plain => unreachable!("PLAIN has no key derivation"),
    }
}

// ── SCRAM client flow ────────────────────────────────────────────────────

fn auth_failure(msg: impl Into<String>) -> ReefError {
    ReefError::Handshake(HandshakeError::AuthFailure(msg.into()))
}

/// Escape `=` and `,` in a SCRAM username.
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Client side of one SCRAM exchange.
///
/// `client_first` → server-first → `client_final` → server-final →
/// `verify_server_final`. Any deviation is an [`HandshakeError::AuthFailure`].
pub struct ScramClient {
    mech: Mechanism,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(mech: Mechanism, username: &str, password: &str) -> ScramClient {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(mech, username, password, nonce)
    }

    /// Deterministic-nonce constructor, for tests against published vectors.
    pub fn with_nonce(
        mech: Mechanism,
        username: &str,
        password: &str,
        client_nonce: String,
    ) -> ScramClient {
        let client_first_bare =
            format!("n={},r={}", escape_username(username), client_nonce);
        ScramClient {
            mech,
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            auth_message: None,
            salted_password: None,
        }
    }

    /// The client-first message (with GS2 header, no channel binding).
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume the server-first message and produce client-final.
    pub fn client_final(&mut self, server_first: &[u8]) -> ReefResult<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_failure("server-first is not UTF-8"))?
            .to_string();

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            match field.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(B64.decode(v).map_err(|_| auth_failure("bad salt"))?)
                }
                Some(("i", v)) => {
                    iterations =
                        Some(v.parse::<u32>().map_err(|_| auth_failure("bad iteration count"))?)
                }
                _ => {} // extensions are ignored
            }
        }
        let server_nonce = server_nonce.ok_or_else(|| auth_failure("server-first lacks nonce"))?;
        let salt = salt.ok_or_else(|| auth_failure("server-first lacks salt"))?;
        let iterations = iterations.ok_or_else(|| auth_failure("server-first lacks iterations"))?;
        if iterations == 0 {
            return Err(auth_failure("zero iteration count"));
        }
        if !server_nonce.starts_with(self.client_nonce.as_str()) {
            return Err(auth_failure("server nonce does not extend client nonce"));
        }

        // c=biws is base64("n,,"), matching the GS2 header above.
        let without_proof = format!("c=biws,r={}", server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let salted = mech_hi(self.mech, self.password.as_bytes(), &salt, iterations);
        let client_key = mech_hmac(self.mech, &salted, &[b"Client Key"]);
        let stored_key = mech_hash(self.mech, &client_key);
        let client_signature = mech_hmac(self.mech, &stored_key, &[auth_message.as_bytes()]);
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(k, s)| k ^ s)
            .collect();

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted);

        Ok(format!("{},p={}", without_proof, B64.encode(proof)).into_bytes())
    }

    /// Check the server signature in the server-final message.
    pub fn verify_server_final(&self, server_final: &[u8]) -> ReefResult<()> {
        let (auth_message, salted) = match (&self.auth_message, &self.salted_password) {
            (Some(a), Some(s)) => (a, s),
            _ => return Err(auth_failure("server-final before client-final")),
        };
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_failure("server-final is not UTF-8"))?;
        let signature = server_final
            .split(',')
            .find_map(|f| f.strip_prefix("v="))
            .ok_or_else(|| auth_failure("server-final lacks signature"))?;
        let presented = B64
            .decode(signature)
            .map_err(|_| auth_failure("bad server signature encoding"))?;

        let server_key = mech_hmac(self.mech, salted, &[b"Server Key"]);
        let expected = mech_hmac(self.mech, &server_key, &[auth_message.as_bytes()]);
        if presented != expected {
            return Err(auth_failure("server signature mismatch"));
        }
        Ok(())
    }
}
