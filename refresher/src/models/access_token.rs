//! Access token issued by the session exchange and its persisted form.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kite access tokens are valid for one trading day; the store only records this.
pub const TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_key: String,
    pub active: bool,
}

impl AccessToken {
    pub fn issue(value: impl Into<String>, owner_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            issued_at: now,
            expires_at: now + Duration::hours(TOKEN_LIFETIME_HOURS),
            owner_key: owner_key.into(),
            active: true,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &crate::utils::security::mask_secret(&self.value))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("owner_key", &self.owner_key)
            .field("active", &self.active)
            .finish()
    }
}

/// Database representation of the current token for an owner key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredTokenRecord {
    /// Logical owner; unique.
    pub owner_key: String,
    /// Latest access token value.
    pub access_token: String,
    /// Issue time of the latest token.
    pub updated_at: DateTime<Utc>,
    /// Recorded expiry of the latest token.
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    /// Identity of the job that wrote the latest token.
    pub updated_by: String,
    /// Set on first insert only.
    pub created_at: DateTime<Utc>,
}

impl StoredTokenRecord {
    /// Consumer-side validity check; the store never expires records itself.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// Counts reported by an upsert, mirroring document-store semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
}

impl UpsertOutcome {
    pub fn inserted() -> Self {
        Self::default()
    }

    pub fn updated() -> Self {
        Self {
            matched_count: 1,
            modified_count: 1,
        }
    }
}
