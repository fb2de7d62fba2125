//! Idempotency records (spec §3): a repeated submit with the same key
//! returns the first run instead of creating a second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub run_id: i64,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: impl Into<String>, run_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            run_id,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.created_at > ttl
    }
}
