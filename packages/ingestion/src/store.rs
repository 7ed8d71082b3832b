//! SQLite-backed datastore.
//!
//! The datastore is the sole source of mutual exclusion for the engine:
//! job claims are atomic conditional updates, and every orchestrated
//! projection runs inside a single transaction on this pool.
//!
//! # Example URLs
//! - `sqlite::memory:` - In-memory database (ephemeral, testing)
//! - `sqlite:pipeline.db?mode=rwc` - File-based, create if not exists

use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;

use crate::error::Result;

/// Shared handle to the engine's SQLite pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the given database URL and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// Capped at one connection so every handle sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction for an orchestrated, all-or-nothing effect.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Create the schema if it does not exist yet.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discoveries (
                id BLOB PRIMARY KEY,
                origin TEXT NOT NULL,
                external_id TEXT NOT NULL,
                url TEXT,
                normalized_url TEXT,
                content_hash TEXT,
                hints TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                discovered_at TEXT NOT NULL,
                UNIQUE (origin, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_discoveries_content_hash
                ON discoveries(content_hash);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evidence (
                id BLOB PRIMARY KEY,
                discovery_id BLOB NOT NULL REFERENCES discoveries(id),
                kind TEXT NOT NULL,
                storage_ref TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_evidence_discovery
                ON evidence(discovery_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BLOB PRIMARY KEY,
                kind TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id BLOB NOT NULL,
                dedupe_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                next_run_at TEXT,
                lease_expires_at TEXT,
                worker_id TEXT,
                input TEXT NOT NULL DEFAULT '{}',
                result TEXT,
                error_message TEXT,
                error_kind TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status_kind ON jobs(status, kind);
            CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(lease_expires_at)
                WHERE status = 'claimed';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_dedupe ON jobs(dedupe_key)
                WHERE status IN ('queued', 'claimed');
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id BLOB PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'discovered',
                source_key TEXT NOT NULL,
                confidence REAL,
                risk_flags TEXT NOT NULL DEFAULT '[]',
                snapshot TEXT,
                moderation_route TEXT,
                posting_id BLOB,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_state ON candidates(state);
            CREATE INDEX IF NOT EXISTS idx_candidates_source ON candidates(source_key);

            CREATE TABLE IF NOT EXISTS candidate_discoveries (
                candidate_id BLOB NOT NULL REFERENCES candidates(id),
                discovery_id BLOB NOT NULL REFERENCES discoveries(id),
                PRIMARY KEY (candidate_id, discovery_id)
            );

            CREATE INDEX IF NOT EXISTS idx_candidate_discoveries_discovery
                ON candidate_discoveries(discovery_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id BLOB PRIMARY KEY,
                candidate_id BLOB NOT NULL REFERENCES candidates(id),
                status TEXT NOT NULL DEFAULT 'active',
                title TEXT NOT NULL,
                organization TEXT NOT NULL,
                url TEXT,
                location TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                deadline TEXT,
                description TEXT,
                content_hash TEXT,
                normalized_url TEXT,
                last_seen_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_postings_status ON postings(status);
            CREATE INDEX IF NOT EXISTS idx_postings_content_hash ON postings(content_hash);
            CREATE INDEX IF NOT EXISTS idx_postings_normalized_url ON postings(normalized_url);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trust_policies (
                policy_key TEXT PRIMARY KEY,
                trust_level TEXT NOT NULL,
                auto_publish INTEGER NOT NULL DEFAULT 0,
                requires_moderation INTEGER NOT NULL DEFAULT 1,
                merge_decision_actions TEXT NOT NULL DEFAULT '{}',
                merge_decision_reasons TEXT NOT NULL DEFAULT '{}',
                moderation_routes TEXT NOT NULL DEFAULT '{}',
                default_moderation_route TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provenance_events (
                id BLOB PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id BLOB NOT NULL,
                event_type TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_provenance_entity
                ON provenance_events(entity_type, entity_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
