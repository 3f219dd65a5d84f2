//! Persistent index of assets and the migration runner.

use chrono::Utc;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::Asset;

const INITIAL_MIGRATION_NAME: &str = "0000-00-00-00-00-00-initial.sql";

/// Embedded migration scripts in application order. The initial script
/// creates the migration table itself and is attempted unconditionally.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        INITIAL_MIGRATION_NAME,
        include_str!("../migrations/0000-00-00-00-00-00-initial.sql"),
    ),
    (
        "2023-01-11-00-00-00-create-asset.sql",
        include_str!("../migrations/2023-01-11-00-00-00-create-asset.sql"),
    ),
    (
        "2023-01-12-00-00-00-index-original-url.sql",
        include_str!("../migrations/2023-01-12-00-00-00-index-original-url.sql"),
    ),
];

#[derive(Clone)]
pub struct AssetRepository {
    db: Database,
}

impl AssetRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply pending migrations. Idempotent: each script runs to success at
    /// most once, and every attempt leaves its outcome in `assets_migration`.
    pub async fn migrate(&self) -> Result<()> {
        // the initial migration creates the migration table; it is expected
        // to fail on every run but the first
        let _ = self.apply_migration(INITIAL_MIGRATION_NAME, true).await;

        for (name, script) in MIGRATIONS {
            if *name == INITIAL_MIGRATION_NAME {
                continue;
            }
            self.apply_migration_script(name, script, false)
                .await
                .map_err(|e| e.context(format!("apply migration {name:?}")))?;
        }
        Ok(())
    }

    async fn apply_migration(&self, name: &str, skip_pre_check: bool) -> Result<()> {
        let script = MIGRATIONS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| AppError::Internal(format!("unknown migration {name:?}")))?;
        self.apply_migration_script(name, script, skip_pre_check)
            .await
    }

    async fn apply_migration_script(
        &self,
        name: &str,
        script: &str,
        skip_pre_check: bool,
    ) -> Result<()> {
        if !skip_pre_check {
            let applied: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM assets_migration WHERE name = ?1 AND error = ''",
            )
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| AppError::from(e).context(format!("pre-check migration {name:?}")))?;
            if applied.is_some() {
                return Ok(());
            }
        }

        let result = self.execute_in_transaction(script).await;
        let error_message = match &result {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };

        // record the attempt; for the initial migration a plain insert keeps
        // the first success row intact across repeated runs
        let record = if skip_pre_check {
            sqlx::query("INSERT INTO assets_migration (name, btime, error) VALUES (?1, ?2, ?3)")
        } else {
            sqlx::query(
                "INSERT INTO assets_migration (name, btime, error) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (name) DO UPDATE SET btime = excluded.btime, error = excluded.error",
            )
        }
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(&error_message)
        .execute(self.db.pool())
        .await;

        match (result, record) {
            (Ok(()), Err(e)) => {
                Err(AppError::from(e).context(format!("record migration {name:?}")))
            }
            (result, _) => result,
        }
    }

    async fn execute_in_transaction(&self, script: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::raw_sql(script).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_asset_key(&self, asset_key: &str) -> Result<Asset> {
        sqlx::query_as("SELECT * FROM asset WHERE asset_key = ?1")
            .bind(asset_key)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("select asset by asset key: row not found".into()))
    }

    /// Look up an asset by its source URL. With `allow_error = false` only
    /// the canonical row (empty `error`) qualifies.
    pub async fn get_by_original_url(&self, original_url: &str, allow_error: bool) -> Result<Asset> {
        sqlx::query_as("SELECT * FROM asset WHERE original_url = ?1 AND (?2 OR error = '') LIMIT 1")
            .bind(original_url)
            .bind(allow_error)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("select asset by original url: row not found".into()))
    }

    /// Insert a new row; fails on an asset-key collision.
    pub async fn insert(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            "INSERT INTO asset \
             (asset_key, btime, size, content_hash, content_type, original_name, \
              user_id, original_url, deleted, storage_name, status, info, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&asset.asset_key)
        .bind(&asset.btime)
        .bind(asset.size)
        .bind(&asset.content_hash)
        .bind(&asset.content_type)
        .bind(&asset.original_name)
        .bind(&asset.user_id)
        .bind(&asset.original_url)
        .bind(asset.deleted)
        .bind(&asset.storage_name)
        .bind(asset.status)
        .bind(&asset.info)
        .bind(&asset.error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Update the row matching `asset_key`, stamping `mtime`.
    pub async fn update(&self, asset: &mut Asset) -> Result<()> {
        asset.mtime = Some(Utc::now().to_rfc3339());

        sqlx::query(
            "UPDATE asset SET \
               mtime = ?2 \
             , dtime = ?3 \
             , size = ?4 \
             , content_hash = ?5 \
             , content_type = ?6 \
             , original_name = ?7 \
             , user_id = ?8 \
             , original_url = ?9 \
             , deleted = ?10 \
             , storage_name = ?11 \
             , status = ?12 \
             , info = ?13 \
             , error = ?14 \
             WHERE asset_key = ?1",
        )
        .bind(&asset.asset_key)
        .bind(&asset.mtime)
        .bind(&asset.dtime)
        .bind(asset.size)
        .bind(&asset.content_hash)
        .bind(&asset.content_type)
        .bind(&asset.original_name)
        .bind(&asset.user_id)
        .bind(&asset.original_url)
        .bind(asset.deleted)
        .bind(&asset.storage_name)
        .bind(asset.status)
        .bind(&asset.info)
        .bind(&asset.error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
