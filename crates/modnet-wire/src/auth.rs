//! Authorization file: security policy per protocol.
//!
//! One policy per line:
//!
//! ```text
//! # protocol      type            material
//! (raw)           IDEA            6b65792d6d6174657269616c
//! overlay         KeyOnly         00112233445566778899aabbccddeeff  0badc0de
//! modnet_control  PGP-IDEA        orchestrator@lab
//! modnet_stdio    DropEncryption
//! @recipient      orchestrator@lab  <x25519 public key, hex>
//! @secret         orchestrator@lab  <x25519 secret key, hex>
//! ```
//!
//! `(raw)` names the pre-protocol layer every connection passes through.
//! Symmetric material is one or two hex fields (key, optional IV); the
//! converter key is `SHA-256(key || iv)`.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Pseudo protocol name for the raw (pre-protocol) layer.
pub const RAW_PROTOCOL: &str = "(raw)";

/// Errors loading the authorization file.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("DropEncryption is not allowed for the raw layer (line {line})")]
    IllegalRawPolicy { line: usize },
}

/// What cryptographic negotiation a layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    /// Pre-shared key used for the challenge only, then dropped.
    KeyOnly,
    /// Pre-shared key kept for the whole connection unless both ends share a host.
    Idea,
    /// Random session key sealed to one named recipient, then as `Idea`.
    PgpIdea,
    /// Discard any raw-layer converter for this protocol.
    DropEncryption,
}

impl SecurityType {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "KeyOnly" => Some(Self::KeyOnly),
            "IDEA" => Some(Self::Idea),
            "PGP-IDEA" => Some(Self::PgpIdea),
            "DropEncryption" => Some(Self::DropEncryption),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::KeyOnly => "KeyOnly",
            Self::Idea => "IDEA",
            Self::PgpIdea => "PGP-IDEA",
            Self::DropEncryption => "DropEncryption",
        }
    }

    /// Whether the converter goes away once the challenge has passed.
    pub fn drops_after_verify(&self, same_host: bool) -> bool {
        match self {
            Self::KeyOnly | Self::DropEncryption => true,
            Self::Idea | Self::PgpIdea => same_host,
        }
    }
}

impl std::fmt::Display for SecurityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Key material attached to a policy.
#[derive(Clone)]
pub enum KeyMaterial {
    None,
    Symmetric(Zeroizing<[u8; 32]>),
    Recipient(String),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Symmetric(_) => write!(f, "Symmetric(<redacted>)"),
            Self::Recipient(id) => write!(f, "Recipient({id})"),
        }
    }
}

/// Policy for one protocol name.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub security: SecurityType,
    pub material: KeyMaterial,
}

impl AuthPolicy {
    /// Policy with a symmetric key derived from raw key bytes.
    pub fn symmetric(security: SecurityType, key: &[u8], iv: &[u8]) -> Self {
        Self {
            security,
            material: KeyMaterial::Symmetric(derive_key(key, iv)),
        }
    }

    pub fn sealed_to(recipient: impl Into<String>) -> Self {
        Self {
            security: SecurityType::PgpIdea,
            material: KeyMaterial::Recipient(recipient.into()),
        }
    }

    pub fn drop_encryption() -> Self {
        Self {
            security: SecurityType::DropEncryption,
            material: KeyMaterial::None,
        }
    }

    pub fn symmetric_key(&self) -> Option<&[u8; 32]> {
        match &self.material {
            KeyMaterial::Symmetric(key) => Some(key),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<&str> {
        match &self.material {
            KeyMaterial::Recipient(id) => Some(id),
            _ => None,
        }
    }
}

fn derive_key(key: &[u8], iv: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(iv);
    Zeroizing::new(hasher.finalize().into())
}

/// All policies and asymmetric identities known to this process.
#[derive(Default, Clone)]
pub struct AuthPolicies {
    policies: HashMap<String, AuthPolicy>,
    recipients: HashMap<String, PublicKey>,
    secrets: HashMap<String, StaticSecret>,
}

impl std::fmt::Debug for AuthPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPolicies")
            .field("policies", &self.policies)
            .field("recipients", &self.recipients.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl AuthPolicies {
    /// No policies: every layer is unauthenticated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the authorization file. A missing file yields empty policies.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            debug!(path = %path.display(), "No authorization file, connections are unauthenticated");
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let policies = Self::parse(&contents)?;
        info!(
            path = %path.display(),
            policies = policies.policies.len(),
            "Loaded authorization file"
        );
        Ok(policies)
    }

    /// Parse authorization file contents.
    pub fn parse(contents: &str) -> Result<Self, AuthError> {
        let mut result = Self::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = idx + 1;
            let text = raw_line.split('#').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }
            let fields: Vec<&str> = text.split_whitespace().collect();
            let parse_err = |message: String| AuthError::Parse { line, message };

            match fields[0] {
                "@recipient" | "@secret" => {
                    if fields.len() != 3 {
                        return Err(parse_err(format!("{} needs an identity and a key", fields[0])));
                    }
                    let key = decode_key32(fields[2]).map_err(parse_err)?;
                    if fields[0] == "@recipient" {
                        result.recipients.insert(fields[1].to_string(), PublicKey::from(key));
                    } else {
                        result.secrets.insert(fields[1].to_string(), StaticSecret::from(key));
                    }
                }
                protocol => {
                    if fields.len() < 2 {
                        return Err(parse_err(format!("missing security type for \"{protocol}\"")));
                    }
                    let security = SecurityType::from_keyword(fields[1])
                        .ok_or_else(|| parse_err(format!("unknown security type \"{}\"", fields[1])))?;
                    let policy = match security {
                        SecurityType::DropEncryption => {
                            if protocol == RAW_PROTOCOL {
                                return Err(AuthError::IllegalRawPolicy { line });
                            }
                            AuthPolicy::drop_encryption()
                        }
                        SecurityType::PgpIdea => {
                            let recipient = fields
                                .get(2)
                                .ok_or_else(|| parse_err("PGP-IDEA needs a recipient identity".into()))?;
                            AuthPolicy::sealed_to(*recipient)
                        }
                        SecurityType::KeyOnly | SecurityType::Idea => {
                            let key_hex = fields
                                .get(2)
                                .ok_or_else(|| parse_err(format!("{security} needs a hex key")))?;
                            let key = Zeroizing::new(
                                hex::decode(key_hex)
                                    .map_err(|e| parse_err(format!("bad hex key: {e}")))?,
                            );
                            let iv = match fields.get(3) {
                                Some(iv_hex) => hex::decode(iv_hex)
                                    .map_err(|e| parse_err(format!("bad hex IV: {e}")))?,
                                None => Vec::new(),
                            };
                            if key.is_empty() {
                                return Err(parse_err("empty key".into()));
                            }
                            AuthPolicy::symmetric(security, &key, &iv)
                        }
                    };
                    result.policies.insert(protocol.to_string(), policy);
                }
            }
        }
        Ok(result)
    }

    /// Policy for a protocol name (or [`RAW_PROTOCOL`]).
    pub fn get(&self, protocol: &str) -> Option<&AuthPolicy> {
        self.policies.get(protocol)
    }

    /// Install a policy programmatically.
    ///
    /// # Panics
    /// If `DropEncryption` is set for the raw layer.
    pub fn set(&mut self, protocol: impl Into<String>, policy: AuthPolicy) {
        let protocol = protocol.into();
        assert!(
            !(protocol == RAW_PROTOCOL && policy.security == SecurityType::DropEncryption),
            "DropEncryption is not allowed for the raw layer"
        );
        self.policies.insert(protocol, policy);
    }

    pub fn add_recipient(&mut self, identity: impl Into<String>, key: PublicKey) {
        self.recipients.insert(identity.into(), key);
    }

    pub fn add_secret(&mut self, identity: impl Into<String>, secret: StaticSecret) {
        self.secrets.insert(identity.into(), secret);
    }

    pub fn recipient_key(&self, identity: &str) -> Option<&PublicKey> {
        self.recipients.get(identity)
    }

    pub fn secret_key(&self, identity: &str) -> Option<&StaticSecret> {
        self.secrets.get(identity)
    }
}

fn decode_key32(hex_key: &str) -> Result<[u8; 32], String> {
    let bytes = Zeroizing::new(hex::decode(hex_key).map_err(|e| format!("bad hex key: {e}"))?);
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected a 32-byte key, got {} bytes", bytes.len()))
}
