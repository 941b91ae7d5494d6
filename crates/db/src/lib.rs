use anyhow::{Context, Result};
use ghw_core::{
    config::DbConfig,
    models::{RepositoryConfig, WebhookRecord},
};
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::MigrateDatabase, sqlite::SqliteRow};

/// Persistent deployment configuration and webhook registrations.
///
/// Every operation is a single statement, so concurrent requests for
/// different repositories never observe a partially written row.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }

    pub async fn get_repo_config(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Option<RepositoryConfig>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT owner, name, branch, buildCommand, pm2Command, caddyConfig, needsInstall, isBun
            FROM repos
            WHERE owner = ? COLLATE NOCASE AND name = ? COLLATE NOCASE AND branch = ?
            "#,
        )
        .bind(owner)
        .bind(name)
        .bind(branch)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to fetch config for {owner}/{name}@{branch}"))?;
        row.as_ref().map(repo_config_from_row).transpose()
    }

    /// Insert a config, or update the mutable fields of the existing row with
    /// the same (owner, name, branch).
    pub async fn upsert_repo_config(&self, config: &RepositoryConfig) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO repos (owner, name, branch, buildCommand, pm2Command, caddyConfig, needsInstall, isBun)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (owner COLLATE NOCASE, name COLLATE NOCASE, branch) DO UPDATE
            SET buildCommand = EXCLUDED.buildCommand,
                pm2Command = EXCLUDED.pm2Command,
                caddyConfig = EXCLUDED.caddyConfig,
                needsInstall = EXCLUDED.needsInstall,
                isBun = EXCLUDED.isBun
            "#,
        )
        .bind(&config.owner)
        .bind(&config.name)
        .bind(&config.branch)
        .bind(&config.build_command)
        .bind(&config.pm2_command)
        .bind(&config.caddy_config)
        .bind(config.needs_install)
        .bind(config.is_bun)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to save config for {}", config.full_name()))?;
        Ok(())
    }

    pub async fn has_webhook(&self, owner: &str, name: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM webhooks WHERE owner = ? COLLATE NOCASE AND name = ? COLLATE NOCASE
            )
            "#,
        )
        .bind(owner)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists != 0)
    }

    pub async fn record_webhook(&self, owner: &str, name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO webhooks (name, owner)
            VALUES (?, ?)
            ON CONFLICT (owner COLLATE NOCASE, name COLLATE NOCASE) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(owner)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to record webhook for {owner}/{name}"))?;
        Ok(())
    }

    pub async fn get_webhooks(&self) -> Result<Vec<WebhookRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT owner, name FROM webhooks ORDER BY owner, name")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| Ok(WebhookRecord { owner: row.try_get("owner")?, name: row.try_get("name")? }))
            .collect()
    }
}

fn repo_config_from_row(row: &SqliteRow) -> Result<RepositoryConfig> {
    // Rows written by older tooling may have NULL commands.
    let text = |column: &str| -> Result<String> {
        Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
    };
    Ok(RepositoryConfig {
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        branch: row.try_get("branch")?,
        build_command: text("buildCommand")?,
        pm2_command: text("pm2Command")?,
        caddy_config: text("caddyConfig")?,
        needs_install: row.try_get::<Option<bool>, _>("needsInstall")?.unwrap_or(false),
        is_bun: row.try_get::<Option<bool>, _>("isBun")?.unwrap_or(false),
        already_deployed: false,
    })
}
