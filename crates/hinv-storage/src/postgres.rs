//! Postgres backend over `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hinv_core::{Artifact, ArtifactId, FactUpdate, HostSighting};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{InsertOutcome, InventoryStore, InventoryTx, PoisonState, Result};

#[derive(Debug, Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn unprocessed_artifact_ids(&self) -> Result<Vec<ArtifactId>> {
        let rows = sqlx::query(
            r#"
            SELECT fileid
              FROM files
             WHERE parsed = false
               AND parse_failed = false
             ORDER BY fileid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<i64, _>("fileid")?);
        }
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn InventoryTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgInventoryTx { tx }))
    }

    async fn merge_network_identity(&self, sighting: &HostSighting) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE hostinfo
               SET ipaddr = $1,
                   os_hostname = $2,
                   dnsttl = NULL
             WHERE certfp = $3
               AND (ipaddr IS DISTINCT FROM $1 OR os_hostname IS DISTINCT FROM $2)
            "#,
        )
        .bind(&sighting.ip_addr)
        .bind(&sighting.os_hostname)
        .bind(&sighting.certfp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_facts(&self, certfp: &str, update: &FactUpdate) -> Result<u64> {
        if update.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE hostinfo SET ");
        let mut assignments = builder.separated(", ");
        for (fact, value) in &update.fields {
            assignments.push(fact.column());
            assignments.push_unseparated(" = ");
            assignments.push_bind_unseparated(value.clone());
        }
        if update.clears_edition() {
            assignments.push("os_edition = NULL");
        }
        builder.push(" WHERE certfp = ");
        builder.push_bind(certfp.to_string());

        debug!(certfp, sql = builder.sql(), "applying host facts");
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn record_poison_attempt(&self, id: ArtifactId, max_attempts: u32) -> Result<PoisonState> {
        let row = sqlx::query(
            r#"
            UPDATE files
               SET parse_attempts = parse_attempts + 1,
                   parse_failed = ($2::int > 0 AND parse_attempts + 1 >= $2::int)
             WHERE fileid = $1
         RETURNING parse_attempts, parse_failed
            "#,
        )
        .bind(id)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(PoisonState::default());
        };
        let attempts: i32 = row.try_get("parse_attempts")?;
        Ok(PoisonState {
            attempts: attempts.max(0) as u32,
            failed: row.try_get("parse_failed")?,
        })
    }
}

struct PgInventoryTx {
    tx: Transaction<'static, Postgres>,
}

fn artifact_from_row(row: &PgRow) -> Result<Artifact> {
    Ok(Artifact {
        id: row.try_get("fileid")?,
        name: row.try_get("filename")?,
        content: row.try_get("content")?,
        captured_at: row.try_get::<Option<DateTime<Utc>>, _>("received")?,
        is_command: row.try_get("is_command")?,
        certfp: row.try_get("certfp")?,
        ip_addr: row.try_get("ipaddr")?,
        client_version: row.try_get("clientversion")?,
        os_hostname: row.try_get("os_hostname")?,
    })
}

#[async_trait]
impl InventoryTx for PgInventoryTx {
    async fn load_artifact(&mut self, id: ArtifactId) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            r#"
            SELECT fileid, filename, content, received, is_command,
                   certfp, ipaddr, clientversion, os_hostname
              FROM files
             WHERE fileid = $1
               AND parsed = false
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn touch_host(&mut self, sighting: &HostSighting) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE hostinfo
               SET lastseen = $1,
                   clientversion = $2
             WHERE certfp = $3
            "#,
        )
        .bind(sighting.last_seen)
        .bind(&sighting.client_version)
        .bind(&sighting.certfp)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_host(&mut self, sighting: &HostSighting) -> Result<InsertOutcome> {
        // ON CONFLICT keeps a concurrent insert from aborting this transaction.
        let result = sqlx::query(
            r#"
            INSERT INTO hostinfo (lastseen, ipaddr, clientversion, os_hostname, certfp)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (certfp) DO NOTHING
            "#,
        )
        .bind(sighting.last_seen)
        .bind(&sighting.ip_addr)
        .bind(&sighting.client_version)
        .bind(&sighting.os_hostname)
        .bind(&sighting.certfp)
        .execute(&mut *self.tx)
        .await?;
        Ok(if result.rows_affected() > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    async fn mark_processed(&mut self, id: ArtifactId) -> Result<()> {
        sqlx::query("UPDATE files SET parsed = true WHERE fileid = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
