//! Signature Service (spec §4.9).
//!
//! Issues and validates short-lived signed access tokens for relay
//! endpoints and buffer access URLs. Tokens carry a resource type, an
//! action mask, and an expiry; validation tries the primary key then the
//! secondary, so a rotation is non-disruptive — a token signed before
//! rotation keeps validating until its own expiry (spec §8 property 8).
//!
//! ## Token format
//!
//! `base64url(json(TokenPayload)).hex(hmac_sha256(payload_bytes))`, i.e. a
//! signed-query-parameter scheme collapsed into one opaque string; the HTTP
//! layer (spec §6's `{sig, se, sp, sr}` query params) splits it back out
//! when mapping to/from a signed URL.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tyger_types::{ErrorKind, TygerError};

type HmacSha256 = Hmac<Sha256>;

/// Resource type a token authorizes access to (spec §6's `sr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Container,
    Blob,
}

/// Action mask a token grants (spec §4.2's permission sets collapse to
/// this bit-set at the signing layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMask {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl ActionMask {
    pub fn read_only() -> Self {
        Self {
            read: true,
            add: false,
            create: false,
            write: false,
            delete: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            add: true,
            create: true,
            write: true,
            delete: true,
        }
    }

    /// Whether this mask permits `requested` (every bit `requested` sets
    /// must also be set here).
    fn permits(self, requested: ActionMask) -> bool {
        (!requested.read || self.read)
            && (!requested.add || self.add)
            && (!requested.create || self.create)
            && (!requested.write || self.write)
            && (!requested.delete || self.delete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    resource_type: ResourceType,
    resource: String,
    actions: ActionMask,
    expires_at: DateTime<Utc>,
}

/// Outcome of [`SignatureService::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    InvalidSas,
    ActionNotAllowed,
}

/// A single HMAC key, identified only by which slot (primary/secondary) it
/// occupies.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generates a fresh 256-bit key, for rotation.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Issues and validates signed tokens. Holds a primary key and an optional
/// secondary, matching spec §9's "signing keys ... are process-wide
/// singletons initialized at startup".
pub struct SignatureService {
    primary: SigningKey,
    secondary: Option<SigningKey>,
}

impl SignatureService {
    pub fn new(primary: SigningKey) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    /// Rotates in a new primary key, retaining the old one as secondary so
    /// outstanding tokens keep validating until they expire.
    pub fn rotate(&mut self, new_primary: SigningKey) {
        let old_primary = std::mem::replace(&mut self.primary, new_primary);
        self.secondary = Some(old_primary);
    }

    pub fn sign(
        &self,
        resource_type: ResourceType,
        resource: &str,
        actions: ActionMask,
        validity_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, TygerError> {
        let payload = TokenPayload {
            resource_type,
            resource: resource.to_string(),
            actions,
            expires_at: now + validity_window,
        };
        encode_token(&payload, &self.primary)
    }

    pub fn validate(
        &self,
        token: &str,
        resource: &str,
        requested_action: ActionMask,
        now: DateTime<Utc>,
    ) -> ValidationOutcome {
        let payload = match decode_token(token, &self.primary)
            .or_else(|| self.secondary.as_ref().and_then(|k| decode_token(token, k)))
        {
            Some(p) => p,
            None => return ValidationOutcome::InvalidSas,
        };

        if payload.resource != resource {
            return ValidationOutcome::InvalidSas;
        }
        if payload.expires_at <= now {
            return ValidationOutcome::InvalidSas;
        }
        if !payload.actions.permits(requested_action) {
            return ValidationOutcome::ActionNotAllowed;
        }
        ValidationOutcome::Ok
    }
}

fn encode_token(payload: &TokenPayload, key: &SigningKey) -> Result<String, TygerError> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| TygerError::new(ErrorKind::Fatal, format!("token payload encode: {e}")))?;
    let body = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &json);

    let mut mac = HmacSha256::new_from_slice(&key.0)
        .map_err(|e| TygerError::new(ErrorKind::Fatal, format!("hmac key: {e}")))?;
    mac.update(json.as_slice());
    let signature = hex::encode(mac.finalize().into_bytes());

    Ok(format!("{body}.{signature}"))
}

fn decode_token(token: &str, key: &SigningKey) -> Option<TokenPayload> {
    let (body, signature) = token.split_once('.')?;
    let json = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, body).ok()?;

    let mut mac = HmacSha256::new_from_slice(&key.0).ok()?;
    mac.update(json.as_slice());
    let expected = hex::decode(signature).ok()?;
    mac.verify_slice(&expected).ok()?;

    serde_json::from_slice(&json).ok()
}
