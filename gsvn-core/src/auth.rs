//! Authentication providers for GSvn
//!
//! Supports multiple authentication backends including:
//! - Local user table (plaintext secrets, PLAIN and CRAM-MD5)
//! - Htpasswd file-based authentication (PLAIN only)
//! - Provider chains that try several backends in order

use async_trait::async_trait;
use base64::Engine;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// An authenticated identity
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    name: String,
    groups: BTreeSet<String>,
    anonymous: bool,
}

impl User {
    /// A named user with the given group memberships
    pub fn named<I, S>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
            anonymous: false,
        }
    }

    /// The anonymous identity
    pub fn anonymous() -> Self {
        Self {
            name: "$anonymous".to_string(),
            groups: BTreeSet::new(),
            anonymous: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// SASL-style mechanisms offered during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Anonymous,
    Plain,
    CramMd5,
}

impl Mechanism {
    pub fn as_word(&self) -> &'static str {
        match self {
            Self::Anonymous => "ANONYMOUS",
            Self::Plain => "PLAIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "ANONYMOUS" => Some(Self::Anonymous),
            "PLAIN" => Some(Self::Plain),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }
}

/// Credentials presented by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Plain {
        username: String,
        password: String,
    },
    /// `digest` is the lowercase hex HMAC-MD5 of `challenge` keyed by the password
    CramMd5 {
        username: String,
        challenge: String,
        digest: String,
    },
}

impl Credentials {
    /// Decode a PLAIN token (`authzid NUL authcid NUL password`, base64 encoded)
    pub fn from_plain_token(token: &[u8]) -> Option<Self> {
        let trimmed: Vec<u8> = token
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let mut parts = text.split('\0');
        let _authzid = parts.next()?;
        let username = parts.next()?.to_string();
        let password = parts.next()?.to_string();
        if parts.next().is_some() || username.is_empty() {
            return None;
        }
        Some(Self::Plain { username, password })
    }

    /// Decode a CRAM-MD5 response (`username SP hexdigest`)
    pub fn from_cram_md5_response(challenge: &str, response: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(response).ok()?;
        let (username, digest) = text.trim().rsplit_once(' ')?;
        if username.is_empty() || digest.len() != 32 {
            return None;
        }
        Some(Self::CramMd5 {
            username: username.to_string(),
            challenge: challenge.to_string(),
            digest: digest.to_ascii_lowercase(),
        })
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Plain { username, .. } | Self::CramMd5 { username, .. } => Some(username),
        }
    }
}

/// Authentication result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// Authentication successful
    Success(User),
    /// Authentication denied, with the reason reported to the client
    Failed(String),
    /// Provider error (e.g., unreadable backend)
    Error(String),
}

/// Authentication provider trait
///
/// All authentication providers must implement this trait.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether this provider can verify credentials of the given mechanism
    fn supports(&self, mechanism: Mechanism) -> bool;

    /// Authenticate a user with the given credentials
    async fn authenticate(&self, credentials: &Credentials) -> AuthResult;
}

/// HMAC-MD5 as used by CRAM-MD5 (RFC 2104 over the md5 compression function)
pub fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    const BLOCK: usize = 64;
    let mut block = [0u8; BLOCK];
    if key.len() > BLOCK {
        block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let ipad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();

    let mut inner = md5::Context::new();
    inner.consume(&ipad);
    inner.consume(message);
    let inner_hash = inner.compute();

    let mut outer = md5::Context::new();
    outer.consume(&opad);
    outer.consume(inner_hash.0);
    outer.compute().0
}

/// Compute the hex CRAM-MD5 digest a client would send for `password`
pub fn cram_md5_digest(password: &str, challenge: &str) -> String {
    hex::encode(hmac_md5(password.as_bytes(), challenge.as_bytes()))
}

/// Entry in the local user table
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub name: String,
    pub password: String,
    pub groups: Vec<String>,
}

/// Local user database with plaintext secrets
///
/// The only provider able to serve CRAM-MD5, since the challenge digest
/// has to be recomputed from the secret.
#[derive(Clone, Default)]
pub struct LocalUserDb {
    users: HashMap<String, LocalUser>,
}

impl LocalUserDb {
    pub fn new(users: impl IntoIterator<Item = LocalUser>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.name.clone(), u)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn user(&self, entry: &LocalUser) -> User {
        User::named(entry.name.clone(), entry.groups.iter().cloned())
    }
}

#[async_trait]
impl Authenticator for LocalUserDb {
    fn supports(&self, mechanism: Mechanism) -> bool {
        matches!(mechanism, Mechanism::Plain | Mechanism::CramMd5)
    }

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult {
        match credentials {
            Credentials::Anonymous => AuthResult::Failed("Anonymous access is not handled here".into()),
            Credentials::Plain { username, password } => match self.users.get(username) {
                Some(entry) if entry.password == *password => AuthResult::Success(self.user(entry)),
                _ => AuthResult::Failed("Username or password mismatch".into()),
            },
            Credentials::CramMd5 {
                username,
                challenge,
                digest,
            } => match self.users.get(username) {
                Some(entry) if cram_md5_digest(&entry.password, challenge) == *digest => {
                    AuthResult::Success(self.user(entry))
                }
                _ => AuthResult::Failed("Username or password mismatch".into()),
            },
        }
    }
}

/// Htpasswd-based authentication provider
///
/// Supports Apache-style htpasswd file formats:
/// - bcrypt ($2y$, $2b$, $2a$)
/// - SHA1 ({SHA})
///
/// Example htpasswd file:
/// ```text
/// admin:$2y$05$rGZz6f3q9W5v7xY8zM2mLe8wW0k9vY6gQ4hMxLkNnMzKqPpJrWQ6e
/// alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=
/// ```
#[derive(Clone)]
pub struct HtpasswdAuthenticator {
    users: HashMap<String, String>, // username -> password_hash
}

impl HtpasswdAuthenticator {
    /// Create a new htpasswd provider from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read htpasswd file: {}", e))?;

        Self::parse(&content)
    }

    /// Create a new htpasswd provider from raw content
    pub fn from_content(content: &str) -> Result<Self, String> {
        Self::parse(content)
    }

    fn parse(content: &str) -> Result<Self, String> {
        let mut users = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Format: username:hash
            let Some((username, hash)) = line.split_once(':') else {
                return Err(format!("Invalid htpasswd line: {}", line));
            };
            let (username, hash) = (username.trim(), hash.trim());

            if username.is_empty() || hash.is_empty() {
                return Err(format!("Invalid htpasswd line (empty username or hash): {}", line));
            }

            users.insert(username.to_string(), hash.to_string());
        }

        if users.is_empty() {
            return Err("No valid users found in htpasswd file".to_string());
        }

        Ok(Self { users })
    }

    fn verify_bcrypt(hash: &str, password: &str) -> Result<bool, String> {
        #[cfg(feature = "bcrypt-auth")]
        {
            bcrypt::verify(password, hash).map_err(|e| e.to_string())
        }

        #[cfg(not(feature = "bcrypt-auth"))]
        {
            let _ = (hash, password);
            Err("bcrypt verification requires the 'bcrypt-auth' feature".to_string())
        }
    }

    fn verify_sha1(hash: &str, password: &str) -> bool {
        use sha1::{Digest, Sha1};

        let Some(expected) = hash.strip_prefix("{SHA}") else {
            return false;
        };
        let computed = base64::engine::general_purpose::STANDARD.encode(Sha1::digest(password.as_bytes()));
        computed == expected
    }

    fn verify_password(&self, username: &str, password: &str) -> Result<bool, String> {
        let Some(hash) = self.users.get(username) else {
            return Ok(false);
        };

        if hash.starts_with("$2y$") || hash.starts_with("$2b$") || hash.starts_with("$2a$") {
            return Self::verify_bcrypt(hash, password);
        }
        if hash.starts_with("{SHA}") {
            return Ok(Self::verify_sha1(hash, password));
        }

        Err(format!("Unsupported password hash format for user: {}", username))
    }
}

#[async_trait]
impl Authenticator for HtpasswdAuthenticator {
    fn supports(&self, mechanism: Mechanism) -> bool {
        mechanism == Mechanism::Plain
    }

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult {
        let Credentials::Plain { username, password } = credentials else {
            return AuthResult::Failed("Unsupported mechanism".into());
        };
        if username.is_empty() || password.is_empty() {
            return AuthResult::Failed("Username or password mismatch".into());
        }

        match self.verify_password(username, password) {
            Ok(true) => AuthResult::Success(User::named(username.clone(), Vec::<String>::new())),
            Ok(false) => AuthResult::Failed("Username or password mismatch".into()),
            Err(e) => AuthResult::Error(e),
        }
    }
}

/// Tries each provider in order; the first success wins
#[derive(Clone, Default)]
pub struct AuthenticatorChain {
    providers: Vec<Arc<dyn Authenticator>>,
}

impl AuthenticatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn Authenticator>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl Authenticator for AuthenticatorChain {
    fn supports(&self, mechanism: Mechanism) -> bool {
        self.providers.iter().any(|p| p.supports(mechanism))
    }

    async fn authenticate(&self, credentials: &Credentials) -> AuthResult {
        let mut last = AuthResult::Failed("No authentication provider configured".into());
        for provider in &self.providers {
            match provider.authenticate(credentials).await {
                AuthResult::Success(user) => return AuthResult::Success(user),
                AuthResult::Error(e) => {
                    tracing::warn!("Authentication provider error: {}", e);
                    last = AuthResult::Error(e);
                }
                failed => {
                    if !matches!(last, AuthResult::Error(_)) {
                        last = failed;
                    }
                }
            }
        }
        last
    }
}
