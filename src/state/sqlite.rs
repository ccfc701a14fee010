use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use declarative::{Fqn, Stage, StateRecord, StateStore};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SQLite-backed store, one row per FQN
///
/// Queries are short and run on the calling task; the connection lock is
/// never held across an await.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a state database at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database: {}", db_path.display()))?;
        Self::init(conn)
    }

    /// Throwaway database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resources (
                fqn TEXT PRIMARY KEY,
                app TEXT NOT NULL,
                stage TEXT NOT NULL,
                kind TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stage ON resources(app, stage);
            ",
        )
        .context("Failed to create state tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, fqn: &Fqn) -> Result<Option<StateRecord>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM resources WHERE fqn = ?1",
                params![fqn.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to query state for {fqn}"))?;

        raw.map(|raw| {
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse state for {fqn}"))
        })
        .transpose()
    }

    async fn put(&self, fqn: &Fqn, record: &StateRecord) -> Result<()> {
        let mut segments = fqn.segments();
        let (Some(app), Some(stage)) = (segments.next(), segments.next()) else {
            anyhow::bail!("FQN {fqn} is not inside a stage");
        };
        let raw = serde_json::to_string(record).context("Failed to serialize state record")?;

        self.conn()
            .execute(
                "INSERT INTO resources (fqn, app, stage, kind, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(fqn) DO UPDATE SET
                    kind = excluded.kind,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![
                    fqn.as_str(),
                    app,
                    stage,
                    record.kind,
                    raw,
                    Utc::now().to_rfc3339()
                ],
            )
            .with_context(|| format!("Failed to save state for {fqn}"))?;
        Ok(())
    }

    async fn delete(&self, fqn: &Fqn) -> Result<()> {
        self.conn()
            .execute("DELETE FROM resources WHERE fqn = ?1", params![fqn.as_str()])
            .with_context(|| format!("Failed to delete state for {fqn}"))?;
        Ok(())
    }

    async fn list_all(&self, stage: &Stage) -> Result<BTreeSet<Fqn>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT fqn FROM resources WHERE app = ?1 AND stage = ?2")
            .context("Failed to prepare state listing")?;
        let rows = stmt
            .query_map(params![stage.app, stage.name], |row| row.get::<_, String>(0))
            .context("Failed to list state")?;

        let mut fqns = BTreeSet::new();
        for row in rows {
            fqns.insert(Fqn::from(row.context("Failed to read state row")?));
        }
        Ok(fqns)
    }
}
