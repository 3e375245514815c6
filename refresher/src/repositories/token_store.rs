//! Token store: one current access token per owner key.
//!
//! Every write is a single atomic upsert. `created_at` is written only when the
//! owner key is first inserted; later writes replace the token payload and
//! leave it alone.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgConnection;

use crate::db::connection::{self, connect_once};
use crate::error::RefreshError;
use crate::models::{AccessToken, StoredTokenRecord, UpsertOutcome};

/// Repository trait for the persisted access token.
///
/// Mockable with mockall; use `MockTokenStore` in unit tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Writes `token` as the current token of `owner_key`.
    async fn upsert(
        &self,
        token: &AccessToken,
        owner_key: &str,
    ) -> Result<UpsertOutcome, RefreshError>;

    /// Reads the current record of `owner_key`, if any.
    async fn find(&self, owner_key: &str) -> Result<Option<StoredTokenRecord>, RefreshError>;
}

/// PostgreSQL-backed store. Each call opens its own connection and closes it
/// before returning, whatever the outcome. `connect_timeout` bounds both the
/// connect and the statement.
///
/// Reads and writes never touch the schema; call [`PgTokenStore::migrate`]
/// once before the first write.
pub struct PgTokenStore {
    database_url: String,
    connect_timeout: Duration,
    updated_by: String,
}

impl PgTokenStore {
    pub fn new(
        database_url: impl Into<String>,
        connect_timeout: Duration,
        updated_by: impl Into<String>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            connect_timeout,
            updated_by: updated_by.into(),
        }
    }

    /// Applies pending migrations over a short-lived connection.
    pub async fn migrate(&self) -> Result<(), RefreshError> {
        self.with_connection(move |conn| {
            Box::pin(async move {
                connection::migrate(conn)
                    .await
                    .map_err(RefreshError::Persistence)
            })
        })
        .await?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, RefreshError>
    where
        F: for<'c> FnOnce(
            &'c mut PgConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, RefreshError>>,
    {
        let mut conn = connect_once(&self.database_url, self.connect_timeout)
            .await
            .map_err(RefreshError::Persistence)?;

        let result = tokio::time::timeout(self.connect_timeout, op(&mut conn))
            .await
            .unwrap_or_else(|_| {
                Err(RefreshError::Persistence(anyhow!(
                    "Statement timed out after {:?}",
                    self.connect_timeout
                )))
            });

        if let Err(err) = sqlx::Connection::close(conn).await {
            tracing::warn!(error = %err, "Failed to close database connection");
        }
        result
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn upsert(
        &self,
        token: &AccessToken,
        owner_key: &str,
    ) -> Result<UpsertOutcome, RefreshError> {
        let updated_by = self.updated_by.clone();
        let owner_key = owner_key.to_string();
        let token = token.clone();

        let outcome = self
            .with_connection(move |conn| {
                Box::pin(async move {
                    let inserted: bool = sqlx::query_scalar(
                        r#"
                        INSERT INTO access_tokens
                            (owner_key, access_token, updated_at, expires_at, is_active, updated_by, created_at)
                        VALUES ($1, $2, $3, $4, TRUE, $5, $3)
                        ON CONFLICT (owner_key) DO UPDATE
                        SET access_token = EXCLUDED.access_token,
                            updated_at = EXCLUDED.updated_at,
                            expires_at = EXCLUDED.expires_at,
                            is_active = TRUE,
                            updated_by = EXCLUDED.updated_by
                        RETURNING (xmax = 0) AS inserted
                        "#,
                    )
                    .bind(&owner_key)
                    .bind(&token.value)
                    .bind(token.issued_at)
                    .bind(token.expires_at)
                    .bind(&updated_by)
                    .fetch_one(&mut *conn)
                    .await?;

                    Ok::<_, RefreshError>(if inserted {
                        UpsertOutcome::inserted()
                    } else {
                        UpsertOutcome::updated()
                    })
                })
            })
            .await?;

        tracing::info!(
            matched = outcome.matched_count,
            modified = outcome.modified_count,
            "Token record upserted"
        );
        Ok(outcome)
    }

    async fn find(&self, owner_key: &str) -> Result<Option<StoredTokenRecord>, RefreshError> {
        let owner_key = owner_key.to_string();
        self.with_connection(move |conn| {
            Box::pin(async move {
                let record = sqlx::query_as::<_, StoredTokenRecord>(
                    r#"
                    SELECT owner_key, access_token, updated_at, expires_at, is_active, updated_by, created_at
                    FROM access_tokens
                    WHERE owner_key = $1
                    "#,
                )
                .bind(&owner_key)
                .fetch_optional(&mut *conn)
                .await?;
                Ok::<_, RefreshError>(record)
            })
        })
        .await
    }
}

/// In-process store with the same upsert contract, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    updated_by: String,
    records: Mutex<HashMap<String, StoredTokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new(updated_by: impl Into<String>) -> Self {
        Self {
            updated_by: updated_by.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn upsert(
        &self,
        token: &AccessToken,
        owner_key: &str,
    ) -> Result<UpsertOutcome, RefreshError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| RefreshError::Persistence(anyhow!("token store lock poisoned")))?;

        let outcome = match records.get_mut(owner_key) {
            Some(record) => {
                record.access_token = token.value.clone();
                record.updated_at = token.issued_at;
                record.expires_at = token.expires_at;
                record.is_active = true;
                record.updated_by = self.updated_by.clone();
                UpsertOutcome::updated()
            }
            None => {
                records.insert(
                    owner_key.to_string(),
                    StoredTokenRecord {
                        owner_key: owner_key.to_string(),
                        access_token: token.value.clone(),
                        updated_at: token.issued_at,
                        expires_at: token.expires_at,
                        is_active: true,
                        updated_by: self.updated_by.clone(),
                        created_at: token.issued_at,
                    },
                );
                UpsertOutcome::inserted()
            }
        };
        Ok(outcome)
    }

    async fn find(&self, owner_key: &str) -> Result<Option<StoredTokenRecord>, RefreshError> {
        let records = self
            .records
            .lock()
            .map_err(|_| RefreshError::Persistence(anyhow!("token store lock poisoned")))?;
        Ok(records.get(owner_key).cloned())
    }
}
