//! Opaque token types and fingerprinting.
//!
//! A token is a pair of independent 128-bit random values: a public key
//! identifying the record and a secret proving possession. The wire form is
//! `gt-<key>.<secret>` with both halves base64url-encoded without padding.
//! Only the SHA-256 hash of the secret is ever stored.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub mod cache;
pub mod minter;
pub mod store;

/// Prefix identifying a Gafaelfawr token on the wire.
const TOKEN_PREFIX: &str = "gt-";

/// Encoded length of a 128-bit value in unpadded base64url.
const COMPONENT_LEN: usize = 22;

/// Reasons a wire token fails to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenFormatError {
    #[error("token does not start with {}", TOKEN_PREFIX)]
    MissingPrefix,

    #[error("token is not of the form gt-<key>.<secret>")]
    MissingSecret,

    #[error("token key is not 128 bits of base64url data")]
    InvalidKey,

    #[error("token secret is not 128 bits of base64url data")]
    InvalidSecret,
}

/// An opaque token: public key plus possession-proving secret.
///
/// `Debug` and `Display` redact the secret; use [`Token::encode`] to obtain
/// the wire form deliberately.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    key: String,
    secret: String,
}

impl Token {
    /// Generate a fresh token from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            key: random_component(),
            secret: random_component(),
        }
    }

    /// Parse the wire form `gt-<key>.<secret>`.
    pub fn parse(wire: &str) -> Result<Self, TokenFormatError> {
        let rest = wire
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(TokenFormatError::MissingPrefix)?;
        let (key, secret) = rest.split_once('.').ok_or(TokenFormatError::MissingSecret)?;
        if !is_component(key) {
            return Err(TokenFormatError::InvalidKey);
        }
        if !is_component(secret) {
            return Err(TokenFormatError::InvalidSecret);
        }
        Ok(Self {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Render the wire form, secret included.
    pub fn encode(&self) -> String {
        format!("{}{}.{}", TOKEN_PREFIX, self.key, self.secret)
    }

    /// Base64url-encoded SHA-256 of the secret octets, the only form of the
    /// secret that is ever persisted.
    pub fn hash_secret(&self) -> String {
        hash_secret_component(&self.secret)
    }

    /// Constant-time check of this token's secret against a stored hash.
    pub fn verify_hash(&self, stored_hash: &str) -> bool {
        let computed = self.hash_secret();
        computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
    }

    /// Constant-time comparison of full wire forms, used for the bootstrap
    /// token.
    pub fn ct_eq_wire(&self, other: &Token) -> bool {
        self.encode().as_bytes().ct_eq(other.encode().as_bytes()).into()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({}{}.<redacted>)", TOKEN_PREFIX, self.key)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}.<redacted>", TOKEN_PREFIX, self.key)
    }
}

impl Serialize for Token {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = String::deserialize(deserializer)?;
        Token::parse(&wire).map_err(serde::de::Error::custom)
    }
}

fn random_component() -> String {
    let mut raw = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut raw)
        .expect("OsRng failed to produce random bytes");
    URL_SAFE_NO_PAD.encode(raw)
}

fn is_component(value: &str) -> bool {
    value.len() == COMPONENT_LEN
        && URL_SAFE_NO_PAD
            .decode(value)
            .map(|raw| raw.len() == 16)
            .unwrap_or(false)
}

fn hash_secret_component(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// The five kinds of token and how each comes into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Root token established by a successful upstream login.
    Session,
    /// User-created token with a name, for scripts and CI.
    User,
    /// Child token carrying the parent's full scopes, for interactive
    /// computing environments.
    Notebook,
    /// Short-lived child token minted for a named downstream service.
    Internal,
    /// Long-lived token for an infrastructure service, created by admins.
    Service,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Session => "session",
            TokenKind::User => "user",
            TokenKind::Notebook => "notebook",
            TokenKind::Internal => "internal",
            TokenKind::Service => "service",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "session" => Some(TokenKind::Session),
            "user" => Some(TokenKind::User),
            "notebook" => Some(TokenKind::Notebook),
            "internal" => Some(TokenKind::Internal),
            "service" => Some(TokenKind::Service),
            _ => None,
        }
    }

    /// Whether tokens of this kind always have a parent.
    pub fn is_child(&self) -> bool {
        matches!(self, TokenKind::Notebook | TokenKind::Internal)
    }
}

/// Full authenticated record of a token, as the decision engine consumes it.
///
/// The email is carried only in the sealed cache record, never in SQL, so it
/// is present on cache hits and absent after a read-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub token: Token,
    pub username: String,
    pub kind: TokenKind,
    pub scopes: BTreeSet<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl TokenData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Remaining lifetime at `now`, or `None` for tokens without expiry.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires.map(|expires| expires - now)
    }

    /// Public projection without the secret.
    pub fn info(&self) -> TokenInfo {
        TokenInfo {
            token: self.token.key().to_string(),
            username: self.username.clone(),
            token_type: self.kind,
            scopes: self.scopes.iter().cloned().collect(),
            created: self.created,
            expires: self.expires,
            token_name: self.token_name.clone(),
            parent: self.parent.clone(),
        }
    }
}

/// Public projection of a token: everything except the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// The token key (not the wire form; the secret is never included).
    pub token: String,
    pub username: String,
    pub token_type: TokenKind,
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Deduplication fingerprint for minted child tokens.
///
/// Internal tokens are shared across requests when parent, target service,
/// and scope set all match; notebook tokens pass no service.
pub fn mint_fingerprint(
    parent_key: &str,
    service: Option<&str>,
    scopes: &BTreeSet<String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(service.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    // BTreeSet iteration is already sorted, which makes this stable.
    for scope in scopes {
        hasher.update(scope.as_bytes());
        hasher.update([b',']);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_round_trip() {
        let token = Token::generate();
        let wire = token.encode();
        assert!(wire.starts_with("gt-"));
        let parsed = Token::parse(&wire).expect("parse");
        assert_eq!(parsed, token);
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert_eq!(
            Token::parse("abcdef").unwrap_err(),
            TokenFormatError::MissingPrefix
        );
        assert_eq!(
            Token::parse("gt-onlykeypart").unwrap_err(),
            TokenFormatError::MissingSecret
        );
        assert_eq!(
            Token::parse("gt-short.aaaaaaaaaaaaaaaaaaaaaa").unwrap_err(),
            TokenFormatError::InvalidKey
        );
        let token = Token::generate();
        let truncated = format!("gt-{}.{}", token.key(), "not!valid+base64=====x");
        assert_eq!(
            Token::parse(&truncated).unwrap_err(),
            TokenFormatError::InvalidSecret
        );
    }

    #[test]
    fn hash_verification_is_exact() {
        let token = Token::generate();
        let hash = token.hash_secret();
        assert!(token.verify_hash(&hash));
        let other = Token::generate();
        assert!(!other.verify_hash(&hash));
    }

    #[test]
    fn debug_redacts_the_secret() {
        let token = Token::generate();
        let rendered = format!("{:?}", token);
        assert!(rendered.contains(token.key()));
        assert!(!rendered.contains(&token.encode()));
    }

    #[test]
    fn fingerprint_ignores_scope_order() {
        let a: BTreeSet<String> = ["read:all", "exec:admin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let b: BTreeSet<String> = ["exec:admin", "read:all"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            mint_fingerprint("key", Some("nublado"), &a),
            mint_fingerprint("key", Some("nublado"), &b)
        );
        assert_ne!(
            mint_fingerprint("key", Some("nublado"), &a),
            mint_fingerprint("key", Some("portal"), &a)
        );
        assert_ne!(
            mint_fingerprint("key", None, &a),
            mint_fingerprint("key", Some("nublado"), &a)
        );
    }
}
