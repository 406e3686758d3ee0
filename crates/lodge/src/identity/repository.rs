//! Identity mapping repository for database operations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::{debug, instrument};

use super::IdentityMapping;

#[derive(Debug, sqlx::FromRow)]
struct IdentityRow {
    external_id: String,
    account_name: String,
    home_dir: String,
    created_at: String,
}

impl TryFrom<IdentityRow> for IdentityMapping {
    type Error = anyhow::Error;

    fn try_from(row: IdentityRow) -> Result<Self> {
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .with_context(|| format!("invalid created_at for '{}'", row.external_id))?
            .with_timezone(&Utc);
        Ok(Self {
            external_id: row.external_id,
            account_name: row.account_name,
            home_dir: PathBuf::from(row.home_dir),
            created_at,
        })
    }
}

/// Repository for identity mappings.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the mapping for an external identity.
    #[instrument(skip(self))]
    pub async fn get(&self, external_id: &str) -> Result<Option<IdentityMapping>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT external_id, account_name, home_dir, created_at
            FROM identities
            WHERE external_id = ?
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch identity")?;

        row.map(IdentityMapping::try_from).transpose()
    }

    /// Get the mapping that owns an account name.
    #[instrument(skip(self))]
    pub async fn get_by_account(&self, account_name: &str) -> Result<Option<IdentityMapping>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT external_id, account_name, home_dir, created_at
            FROM identities
            WHERE account_name = ?
            "#,
        )
        .bind(account_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch identity by account")?;

        row.map(IdentityMapping::try_from).transpose()
    }

    /// Persist a new mapping. Fails if either key is already taken.
    #[instrument(skip(self, mapping), fields(external_id = %mapping.external_id, account = %mapping.account_name))]
    pub async fn insert(&self, mapping: &IdentityMapping) -> Result<()> {
        debug!("Persisting identity mapping");

        sqlx::query(
            r#"
            INSERT INTO identities (external_id, account_name, home_dir, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&mapping.external_id)
        .bind(&mapping.account_name)
        .bind(mapping.home_dir.to_string_lossy().into_owned())
        .bind(mapping.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert identity mapping")?;

        Ok(())
    }

    /// All mappings, oldest first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<IdentityMapping>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT external_id, account_name, home_dir, created_at
            FROM identities
            ORDER BY created_at ASC, external_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list identities")?;

        rows.into_iter().map(IdentityMapping::try_from).collect()
    }
}
