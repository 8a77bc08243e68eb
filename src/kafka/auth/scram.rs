//! SCRAM exchange (RFC 5802 / RFC 7677)
//!
//! `ScramClient` is the mechanism handed to the session: it drives the three
//! messages of the exchange (client-first, client-final after the server
//! challenge, and verification of the server signature). `ScramServer` and
//! `ScramCredential` implement the verifying side and are used by the
//! embedded broker.
//!
//! Channel binding is not supported (`n` GS2 flag).

use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, warn};

use super::ScramAlgorithm;
use crate::kafka::constants::{
    SCRAM_DEFAULT_ITERATIONS, SCRAM_MIN_ITERATIONS, SCRAM_NONCE_BYTES, SCRAM_SALT_BYTES,
};
use crate::kafka::error::{KafkaError, Result};

// ===== Primitives =====

fn hmac_with<H: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <H as KeyInit>::new_from_slice(key).map_err(|e| KafkaError::Auth(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac(algorithm: ScramAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        ScramAlgorithm::Sha256 => hmac_with::<Hmac<Sha256>>(key, data),
        ScramAlgorithm::Sha512 => hmac_with::<Hmac<Sha512>>(key, data),
    }
}

fn hash(algorithm: ScramAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        ScramAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        ScramAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

fn salted_password(
    algorithm: ScramAlgorithm,
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Vec<u8> {
    let mut out = vec![0u8; algorithm.output_len()];
    match algorithm {
        ScramAlgorithm::Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out)
        }
        ScramAlgorithm::Sha512 => {
            pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out)
        }
    }
    out
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_nonce() -> String {
    let mut nonce_bytes = [0u8; SCRAM_NONCE_BYTES];
    rand::thread_rng().fill(&mut nonce_bytes);
    URL_SAFE_NO_PAD.encode(nonce_bytes)
}

/// Escape a SCRAM `saslname` (`=` → `=3D`, `,` → `=2C`)
pub fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Reverse of [`escape_name`]
pub fn unescape_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(idx) = rest.find('=') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        if tail.starts_with("=2C") {
            out.push(',');
        } else if tail.starts_with("=3D") {
            out.push('=');
        } else {
            return Err(KafkaError::Auth(format!("invalid escape in name: {}", name)));
        }
        rest = &tail[3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split `k=v,k=v` into single-letter attributes
fn parse_attributes(message: &str) -> Result<Vec<(char, &str)>> {
    message
        .split(',')
        .map(|part| {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| KafkaError::Auth(format!("malformed attribute: {}", part)))?;
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok((c, value)),
                _ => Err(KafkaError::Auth(format!("malformed attribute: {}", part))),
            }
        })
        .collect()
}

fn attribute<'a>(attrs: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn required<'a>(attrs: &[(char, &'a str)], key: char, message: &str) -> Result<&'a str> {
    attribute(attrs, key)
        .ok_or_else(|| KafkaError::Auth(format!("missing '{}' in {}", key, message)))
}

// ===== Client =====

enum ClientState {
    Idle,
    Started,
    FirstSent {
        client_first_bare: String,
    },
    FinalSent {
        server_signature: Vec<u8>,
    },
    Done,
}

/// Client side of a SCRAM exchange
///
/// Usage mirrors the handshake: `begin` with the credentials, then call
/// `step` with each server message (an empty challenge for the first step)
/// and send back whatever it returns, until `done` reports completion.
pub struct ScramClient {
    algorithm: ScramAlgorithm,
    username: String,
    password: String,
    authz_id: String,
    nonce: String,
    state: ClientState,
}

impl ScramClient {
    /// Create an idle client for the given algorithm
    pub fn new(algorithm: ScramAlgorithm) -> Self {
        Self {
            algorithm,
            username: String::new(),
            password: String::new(),
            authz_id: String::new(),
            nonce: String::new(),
            state: ClientState::Idle,
        }
    }

    /// Use a fixed client nonce instead of a random one
    pub fn with_nonce(mut self, nonce: &str) -> Self {
        self.nonce = nonce.to_string();
        self
    }

    /// Algorithm backing this exchange
    pub fn algorithm(&self) -> ScramAlgorithm {
        self.algorithm
    }

    /// SASL mechanism name
    pub fn mechanism(&self) -> &'static str {
        self.algorithm.mechanism()
    }

    /// Prepare the exchange with the given credentials
    pub fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<()> {
        if username.is_empty() {
            return Err(KafkaError::Auth("username is empty".to_string()));
        }
        self.username = username.to_string();
        self.password = password.to_string();
        self.authz_id = authz_id.to_string();
        if self.nonce.is_empty() {
            self.nonce = generate_nonce();
        }
        self.state = ClientState::Started;
        Ok(())
    }

    /// Advance the exchange with the latest server message
    pub fn step(&mut self, challenge: &str) -> Result<String> {
        match std::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Idle => Err(KafkaError::Auth("exchange not started".to_string())),
            ClientState::Started => {
                let client_first_bare =
                    format!("n={},r={}", escape_name(&self.username), self.nonce);
                let message = format!("{}{}", self.gs2_header(), client_first_bare);
                self.state = ClientState::FirstSent { client_first_bare };
                Ok(message)
            }
            ClientState::FirstSent { client_first_bare } => {
                let (message, server_signature) =
                    self.client_final(&client_first_bare, challenge)?;
                self.state = ClientState::FinalSent { server_signature };
                Ok(message)
            }
            ClientState::FinalSent { server_signature } => {
                self.verify_server_final(&server_signature, challenge)?;
                self.state = ClientState::Done;
                Ok(String::new())
            }
            ClientState::Done => {
                self.state = ClientState::Done;
                Err(KafkaError::Auth("exchange already complete".to_string()))
            }
        }
    }

    /// Whether the server signature has been verified
    pub fn done(&self) -> bool {
        matches!(self.state, ClientState::Done)
    }

    fn gs2_header(&self) -> String {
        if self.authz_id.is_empty() {
            "n,,".to_string()
        } else {
            format!("n,a={},", escape_name(&self.authz_id))
        }
    }

    fn client_final(&self, client_first_bare: &str, server_first: &str) -> Result<(String, Vec<u8>)> {
        let attrs = parse_attributes(server_first)?;
        if let Some(err) = attribute(&attrs, 'e') {
            return Err(KafkaError::Auth(format!("server rejected client-first: {}", err)));
        }
        if attribute(&attrs, 'm').is_some() {
            return Err(KafkaError::Auth(
                "server requires an unsupported SCRAM extension".to_string(),
            ));
        }

        let nonce = required(&attrs, 'r', "server-first")?;
        if !nonce.starts_with(&self.nonce) || nonce.len() <= self.nonce.len() {
            return Err(KafkaError::Auth(
                "server nonce does not extend the client nonce".to_string(),
            ));
        }

        let salt = BASE64
            .decode(required(&attrs, 's', "server-first")?)
            .map_err(|e| KafkaError::Auth(format!("invalid salt: {}", e)))?;
        let iterations: u32 = required(&attrs, 'i', "server-first")?
            .parse()
            .map_err(|_| KafkaError::Auth("invalid iteration count".to_string()))?;
        if iterations == 0 {
            return Err(KafkaError::Auth("iteration count is zero".to_string()));
        }
        if iterations < SCRAM_MIN_ITERATIONS {
            warn!(iterations, "SCRAM server requested a low iteration count");
        }

        let salted = salted_password(self.algorithm, &self.password, &salt, iterations);
        let client_key = hmac(self.algorithm, &salted, b"Client Key")?;
        let stored_key = hash(self.algorithm, &client_key);
        let server_key = hmac(self.algorithm, &salted, b"Server Key")?;

        let without_proof = format!("c={},r={}", BASE64.encode(self.gs2_header()), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac(self.algorithm, &stored_key, auth_message.as_bytes())?;
        let proof = xor(&client_key, &client_signature);
        let server_signature = hmac(self.algorithm, &server_key, auth_message.as_bytes())?;

        Ok((
            format!("{},p={}", without_proof, BASE64.encode(proof)),
            server_signature,
        ))
    }

    fn verify_server_final(&self, expected: &[u8], server_final: &str) -> Result<()> {
        let attrs = parse_attributes(server_final)?;
        if let Some(err) = attribute(&attrs, 'e') {
            return Err(KafkaError::Auth(format!("server rejected proof: {}", err)));
        }
        let signature = BASE64
            .decode(required(&attrs, 'v', "server-final")?)
            .map_err(|e| KafkaError::Auth(format!("invalid server signature: {}", e)))?;
        if !constant_time_eq(&signature, expected) {
            return Err(KafkaError::Auth(
                "server signature does not match".to_string(),
            ));
        }
        debug!(mechanism = self.mechanism(), "SCRAM server signature verified");
        Ok(())
    }
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("algorithm", &self.algorithm)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("done", &self.done())
            .finish()
    }
}

// ===== Verifier =====

/// Stored verifier for one user and one algorithm
#[derive(Clone)]
pub struct ScramCredential {
    pub algorithm: ScramAlgorithm,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramCredential {
    /// Derive a credential from a password with a random salt
    pub fn derive(algorithm: ScramAlgorithm, password: &str) -> Result<Self> {
        let mut salt = vec![0u8; SCRAM_SALT_BYTES];
        rand::thread_rng().fill(salt.as_mut_slice());
        Self::derive_with(algorithm, password, salt, SCRAM_DEFAULT_ITERATIONS)
    }

    /// Derive a credential with an explicit salt and iteration count
    pub fn derive_with(
        algorithm: ScramAlgorithm,
        password: &str,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<Self> {
        let salted = salted_password(algorithm, password, &salt, iterations);
        let client_key = hmac(algorithm, &salted, b"Client Key")?;
        Ok(Self {
            algorithm,
            stored_key: hash(algorithm, &client_key),
            server_key: hmac(algorithm, &salted, b"Server Key")?,
            salt,
            iterations,
        })
    }
}

impl std::fmt::Debug for ScramCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramCredential")
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

enum ServerState {
    AwaitingFirst,
    AwaitingFinal {
        username: String,
        credential: ScramCredential,
        client_first_bare: String,
        server_first: String,
        gs2_header: String,
        nonce: String,
    },
    Done {
        username: String,
    },
    Failed,
}

/// Verifying side of a SCRAM exchange
pub struct ScramServer {
    algorithm: ScramAlgorithm,
    nonce_suffix: Option<String>,
    state: ServerState,
}

impl ScramServer {
    /// Create a verifier expecting a client-first message
    pub fn new(algorithm: ScramAlgorithm) -> Self {
        Self {
            algorithm,
            nonce_suffix: None,
            state: ServerState::AwaitingFirst,
        }
    }

    /// Use a fixed server nonce suffix instead of a random one
    pub fn with_nonce_suffix(mut self, suffix: &str) -> Self {
        self.nonce_suffix = Some(suffix.to_string());
        self
    }

    /// Process one client message
    ///
    /// `lookup` resolves a username to its stored credential for this
    /// server's algorithm. Returns the message to send back.
    pub fn step<F>(&mut self, message: &str, lookup: F) -> Result<String>
    where
        F: FnOnce(&str) -> Option<ScramCredential>,
    {
        let result = match std::mem::replace(&mut self.state, ServerState::Failed) {
            ServerState::AwaitingFirst => self.handle_client_first(message, lookup),
            ServerState::AwaitingFinal {
                username,
                credential,
                client_first_bare,
                server_first,
                gs2_header,
                nonce,
            } => self.handle_client_final(
                message,
                username,
                &credential,
                &client_first_bare,
                &server_first,
                &gs2_header,
                &nonce,
            ),
            ServerState::Done { username } => {
                self.state = ServerState::Done { username };
                return Err(KafkaError::Auth("exchange already complete".to_string()));
            }
            ServerState::Failed => Err(KafkaError::Auth("exchange already failed".to_string())),
        };
        if result.is_err() {
            self.state = ServerState::Failed;
        }
        result
    }

    /// Authenticated username once the exchange completed
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            ServerState::Done { username } => Some(username),
            _ => None,
        }
    }

    /// Whether the client proof has been verified
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ServerState::Done { .. })
    }

    fn handle_client_first<F>(&mut self, message: &str, lookup: F) -> Result<String>
    where
        F: FnOnce(&str) -> Option<ScramCredential>,
    {
        let mut parts = message.splitn(3, ',');
        let flag = parts.next().unwrap_or_default();
        let authz = parts.next();
        let client_first_bare = parts
            .next()
            .ok_or_else(|| KafkaError::Auth("malformed client-first".to_string()))?;
        let authz = authz.unwrap_or_default();
        if flag != "n" && flag != "y" {
            return Err(KafkaError::Auth(
                "channel binding is not supported".to_string(),
            ));
        }
        let gs2_header = format!("{},{},", flag, authz);

        let attrs = parse_attributes(client_first_bare)?;
        let username = unescape_name(required(&attrs, 'n', "client-first")?)?;
        let client_nonce = required(&attrs, 'r', "client-first")?;

        let credential = lookup(&username)
            .filter(|c| c.algorithm == self.algorithm)
            .ok_or_else(|| KafkaError::Auth(format!("unknown user: {}", username)))?;

        let suffix = self.nonce_suffix.clone().unwrap_or_else(generate_nonce);
        let nonce = format!("{}{}", client_nonce, suffix);
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            BASE64.encode(&credential.salt),
            credential.iterations
        );

        self.state = ServerState::AwaitingFinal {
            username,
            credential,
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            gs2_header,
            nonce,
        };
        Ok(server_first)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_client_final(
        &mut self,
        message: &str,
        username: String,
        credential: &ScramCredential,
        client_first_bare: &str,
        server_first: &str,
        gs2_header: &str,
        nonce: &str,
    ) -> Result<String> {
        let attrs = parse_attributes(message)?;
        let binding = required(&attrs, 'c', "client-final")?;
        if binding != BASE64.encode(gs2_header) {
            return Err(KafkaError::Auth("channel binding mismatch".to_string()));
        }
        if required(&attrs, 'r', "client-final")? != nonce {
            return Err(KafkaError::Auth("nonce mismatch".to_string()));
        }
        let proof = BASE64
            .decode(required(&attrs, 'p', "client-final")?)
            .map_err(|e| KafkaError::Auth(format!("invalid proof encoding: {}", e)))?;

        let without_proof = message
            .rfind(",p=")
            .map(|idx| &message[..idx])
            .ok_or_else(|| KafkaError::Auth("malformed client-final".to_string()))?;
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac(
            self.algorithm,
            &credential.stored_key,
            auth_message.as_bytes(),
        )?;
        if proof.len() != client_signature.len() {
            return Err(KafkaError::Auth("invalid proof".to_string()));
        }
        let client_key = xor(&proof, &client_signature);
        if !constant_time_eq(&hash(self.algorithm, &client_key), &credential.stored_key) {
            return Err(KafkaError::Auth("invalid proof".to_string()));
        }

        let server_signature = hmac(
            self.algorithm,
            &credential.server_key,
            auth_message.as_bytes(),
        )?;
        self.state = ServerState::Done { username };
        Ok(format!("v={}", BASE64.encode(server_signature)))
    }
}

impl std::fmt::Debug for ScramServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match &self.state {
            ServerState::AwaitingFirst => "awaiting-first",
            ServerState::AwaitingFinal { .. } => "awaiting-final",
            ServerState::Done { .. } => "done",
            ServerState::Failed => "failed",
        };
        f.debug_struct("ScramServer")
            .field("algorithm", &self.algorithm)
            .field("stage", &stage)
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}
