//! Opaque continuation tokens (SPEC_FULL.md §B.2; spec §4.1's "continuation
//! tokens are opaque, stable, and encode a (createdAt, id) cursor plus
//! filter").

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TygerError};

/// Hash of the list filter a continuation token was issued under, so a
/// token replayed against a different filter is rejected rather than
/// silently resuming the wrong cursor.
pub type FilterHash = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RawToken {
    created_at_millis: i64,
    id: i64,
    filter_hash: FilterHash,
}

/// A decoded cursor. `created_at` + `id` totally orders list pages even
/// when multiple rows share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationToken {
    pub created_at: DateTime<Utc>,
    pub id: i64,
    pub filter_hash: FilterHash,
}

impl ContinuationToken {
    pub fn new(created_at: DateTime<Utc>, id: i64, filter_hash: FilterHash) -> Self {
        Self {
            created_at,
            id,
            filter_hash,
        }
    }

    pub fn encode(self) -> String {
        let raw = RawToken {
            created_at_millis: self.created_at.timestamp_millis(),
            id: self.id,
            filter_hash: self.filter_hash,
        };
        let json = serde_json::to_vec(&raw).expect("RawToken always serializes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, TygerError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TygerError::new(ErrorKind::Invalid, "malformed continuation token"))?;
        let raw: RawToken = serde_json::from_slice(&bytes)
            .map_err(|_| TygerError::new(ErrorKind::Invalid, "malformed continuation token"))?;
        let created_at = Utc
            .timestamp_millis_opt(raw.created_at_millis)
            .single()
            .ok_or_else(|| TygerError::new(ErrorKind::Invalid, "malformed continuation token"))?;
        Ok(Self {
            created_at,
            id: raw.id,
            filter_hash: raw.filter_hash,
        })
    }

    /// Verify the token was issued under the same filter as the current
    /// request; called before trusting the cursor for a new page.
    pub fn check_filter(&self, expected: FilterHash) -> Result<(), TygerError> {
        if self.filter_hash != expected {
            return Err(TygerError::new(
                ErrorKind::Invalid,
                "continuation token does not match the current filter",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let now = Utc::now();
        let token = ContinuationToken::new(now, 42, 7);
        let encoded = token.encode();
        let decoded = ContinuationToken::decode(&encoded).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.filter_hash, 7);
        assert_eq!(decoded.created_at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ContinuationToken::decode("not-a-token!!!").is_err());
    }

    #[test]
    fn filter_mismatch_is_rejected() {
        let token = ContinuationToken::new(Utc::now(), 1, 7);
        assert!(token.check_filter(8).is_err());
        assert!(token.check_filter(7).is_ok());
    }

    #[test]
    fn is_opaque_base64() {
        let token = ContinuationToken::new(Utc::now(), 1, 0).encode();
        assert!(
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(&token)
                .is_ok()
        );
    }
}
