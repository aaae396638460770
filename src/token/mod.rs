//! Bearer token inspection and token sources.
//!
//! The claims decoder reads the payload segment of a JWT-shaped token so the
//! client can derive the subscription address and gate the notification
//! pipeline by role. It performs NO signature verification and is NOT a trust
//! boundary: the backend validates tokens on every call, this is purely an
//! addressing/display convenience.

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Role carried in the token's claims, lowercased before parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Customer,
    Employee,
    Admin,
}

impl UserRole {
    /// Only customers have a per-user notification queue on the backend.
    pub fn entitled_to_notifications(self) -> bool {
        matches!(self, UserRole::Customer)
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "customer" => Ok(UserRole::Customer),
            "employee" => Ok(UserRole::Employee),
            "admin" => Ok(UserRole::Admin),
            other => anyhow::bail!("Unknown role {}", other),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Customer => write!(f, "customer"),
            UserRole::Employee => write!(f, "employee"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

/// Claims decoded from the payload segment of a bearer token.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    /// User identifier, from the `userId` claim falling back to `sub`.
    pub user_id: Option<String>,
    /// Parsed role, if the `role` claim is present and recognized.
    pub role: Option<UserRole>,
    /// The full decoded claims object.
    pub raw: serde_json::Value,
}

impl TokenClaims {
    /// True when both an identity and an entitled role are present.
    pub fn can_receive_notifications(&self) -> bool {
        self.user_id.is_some()
            && self
                .role
                .map(UserRole::entitled_to_notifications)
                .unwrap_or(false)
    }
}

/// Decode the claims of a JWT-shaped token without verifying its signature.
///
/// Returns `None` for anything malformed: wrong segment count, invalid
/// base64url, invalid UTF-8, or a payload that is not a JSON object. Callers
/// must treat `None` as "cannot establish identity" and skip subscription.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) =
        (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Tolerate both padded and unpadded encoders.
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let raw: serde_json::Value = serde_json::from_str(&text).ok()?;
    if !raw.is_object() {
        return None;
    }

    let user_id = ["userId", "sub"]
        .iter()
        .find_map(|claim| raw.get(claim))
        .and_then(claim_as_string);
    let role = raw
        .get("role")
        .and_then(|v| v.as_str())
        .and_then(|s| UserRole::from_str(s).ok());

    Some(TokenClaims { user_id, role, raw })
}

/// Identifier claims show up as strings or numbers depending on the backend.
fn claim_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Source of bearer tokens for the transport and the REST client.
///
/// The connector reads a fresh token at every connect attempt, so rotating
/// the token only requires the source to return the new value; there is no
/// in-place header mutation on a live connection.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token.
    async fn access_token(&self) -> Result<String>;

    /// Obtain a fresh access token from the auth backend and store it.
    async fn refresh(&self) -> Result<String>;
}

/// Token source holding a fixed token, for the CLI and for tests.
///
/// `refresh` is a no-op returning the same value.
pub struct StaticTokenSource {
    token: Mutex<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(token.into()),
        }
    }

    /// Replace the stored token. Picked up at the next connect.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.lock().unwrap() = token.into();
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.lock().unwrap().clone())
    }

    async fn refresh(&self) -> Result<String> {
        self.access_token().await
    }
}
