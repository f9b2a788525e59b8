use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::token::TokenKind;

/// A token record as stored in the `token` table.
///
/// Only the hash of the secret is present; the wire form of a token can
/// never be reconstructed from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRow {
    pub key: String,
    pub hash: String,
    pub username: String,
    pub kind: TokenKind,
    pub token_name: Option<String>,
    pub scopes: BTreeSet<String>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub parent: Option<String>,
}

impl TokenRow {
    /// Construct a TokenRow from raw database column values.
    ///
    /// Centralizes the parsing of the comma-joined scope list, the kind
    /// discriminant, and the epoch timestamps so callers convert rows into
    /// typed models with useful error context.
    pub fn from_db_row(
        key: String,
        hash: String,
        username: String,
        kind_str: String,
        token_name: Option<String>,
        scopes_str: String,
        created_epoch: i64,
        expires_epoch: Option<i64>,
        parent: Option<String>,
    ) -> Result<Self> {
        let kind = TokenKind::from_str(&kind_str)
            .with_context(|| format!("unknown token kind {} for {}", kind_str, key))?;
        let scopes = split_scopes(&scopes_str);
        let created = epoch_to_datetime(created_epoch)
            .with_context(|| format!("invalid created timestamp for {}", key))?;
        let expires = match expires_epoch {
            Some(epoch) => Some(
                epoch_to_datetime(epoch)
                    .with_context(|| format!("invalid expires timestamp for {}", key))?,
            ),
            None => None,
        };
        Ok(TokenRow {
            key,
            hash,
            username,
            kind,
            token_name,
            scopes,
            created,
            expires,
            parent,
        })
    }

    /// The comma-joined scope list as stored in the database.
    pub fn scopes_column(&self) -> String {
        join_scopes(&self.scopes)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// The mutable fields of this row as JSON, for history diffs.
    pub fn mutable_fields(&self) -> serde_json::Value {
        serde_json::json!({
            "scopes": self.scopes,
            "token_name": self.token_name,
            "expires": self.expires.map(|e| e.timestamp()),
        })
    }
}

/// One entry in the token change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub token_key: String,
    pub actor: String,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(token_key: &str, actor: &str, action: HistoryAction, ip: Option<&str>) -> Self {
        HistoryEntry {
            token_key: token_key.to_string(),
            actor: actor.to_string(),
            action,
            timestamp: Utc::now(),
            ip: ip.map(|ip| ip.to_string()),
            before: None,
            after: None,
        }
    }

    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    /// Construct a HistoryEntry from raw database column values.
    pub fn from_db_row(
        token_key: String,
        actor: String,
        action_str: String,
        timestamp_epoch: i64,
        ip: Option<String>,
        before_json: Option<String>,
        after_json: Option<String>,
    ) -> Result<Self> {
        let action = HistoryAction::from_str(&action_str)
            .with_context(|| format!("unknown history action {}", action_str))?;
        let timestamp = epoch_to_datetime(timestamp_epoch)
            .with_context(|| format!("invalid history timestamp for {}", token_key))?;
        let before = before_json
            .map(|raw| serde_json::from_str(&raw).context("parsing history before JSON"))
            .transpose()?;
        let after = after_json
            .map(|raw| serde_json::from_str(&raw).context("parsing history after JSON"))
            .transpose()?;
        Ok(HistoryEntry {
            token_key,
            actor,
            action,
            timestamp,
            ip,
            before,
            after,
        })
    }
}

/// The four recorded lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Create,
    Edit,
    Revoke,
    Expire,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Edit => "edit",
            HistoryAction::Revoke => "revoke",
            HistoryAction::Expire => "expire",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "create" => Some(HistoryAction::Create),
            "edit" => Some(HistoryAction::Edit),
            "revoke" => Some(HistoryAction::Revoke),
            "expire" => Some(HistoryAction::Expire),
            _ => None,
        }
    }
}

pub(crate) fn join_scopes(scopes: &BTreeSet<String>) -> String {
    scopes.iter().cloned().collect::<Vec<_>>().join(",")
}

pub(crate) fn split_scopes(joined: &str) -> BTreeSet<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch, 0).single()
}
