//! Persistent storage for tokens, change history, and admins.
//!
//! SQLite is the durable side of the two-tier token store: it is the source
//! of truth for enumeration, ownership, and history, while the key-value
//! cache (see `token::cache`) serves the authentication fast path. All
//! mutating operations write their history row and the mutation in a single
//! transaction; cache maintenance is the caller's job and happens after the
//! transaction commits.
//!
//! The database uses SQLite with secure file permissions and settings suited
//! to a server workload. All operations run on the blocking thread pool and
//! retry transient failures twice with jittered backoff before surfacing an
//! error.

use anyhow::{Context, Result};
use refinery::embed_migrations;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

// Embed compile-time migrations located under `migrations/sqlite/`.
embed_migrations!("migrations/sqlite");

#[cfg(unix)]
use fs2::FileExt;
#[cfg(unix)]
use std::fs::OpenOptions;

use chrono::Utc;
use rand::Rng;
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio::task;

use crate::utility::{set_secure_dir_permissions, set_secure_file_permissions};

pub mod models;
pub use models::{HistoryAction, HistoryEntry, TokenRow};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    /// A uniqueness constraint was violated (duplicate token name).
    #[error("unique constraint violated")]
    Duplicate,

    /// Any other backend failure, surfaced after retries are exhausted.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e
            && err.code == rusqlite::ErrorCode::ConstraintViolation
        {
            return PersistError::Duplicate;
        }
        PersistError::Backend(e.into())
    }
}

/// Fields of a token that `modify` may change. `None` leaves a field alone;
/// the inner `Option` distinguishes clearing from setting.
#[derive(Debug, Clone, Default)]
pub struct TokenRowUpdate {
    pub scopes: Option<std::collections::BTreeSet<String>>,
    pub token_name: Option<Option<String>>,
    pub expires: Option<Option<chrono::DateTime<Utc>>>,
}

/// SQLite database handle for the token store.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Create a Database handle at the given path, running migrations and
    /// hardening file permissions.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!("Initializing database at path: {}", path.display());
        ensure_parent_dir(&path)?;
        let db = Self {
            db_path: path.clone(),
        };
        db.run_migrations()?;
        if path.exists() {
            set_secure_file_permissions(&path).with_context(|| {
                format!(
                    "setting secure permissions on database file {}",
                    path.display()
                )
            })?;
        }
        tracing::debug!("Database initialized at: {}", path.display());
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let _guard = MigrationLock::new(
            &self.db_path.with_extension("migrate.lock"),
            Duration::from_secs(30),
        )?;
        let mut conn = open_db_connection(&self.db_path)?;
        migrations::runner()
            .run(&mut conn)
            .context("applying embedded migrations")?;
        Ok(())
    }

    /// Run a closure against a fresh connection on the blocking pool,
    /// retrying transient failures twice with jittered backoff.
    async fn call<T, F>(&self, f: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, PersistError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut attempt = 0u32;
            loop {
                let result = open_db_connection(&db_path)
                    .map_err(PersistError::Backend)
                    .and_then(|mut conn| f(&mut conn));
                match result {
                    Err(PersistError::Backend(e)) if attempt < 2 => {
                        attempt += 1;
                        let base = 50u64 * 2u64.pow(attempt - 1);
                        let jitter = rand::rng().random_range(base..=base * 3);
                        tracing::warn!(
                            "transient database failure (attempt {}), retrying in {}ms: {:#}",
                            attempt,
                            jitter,
                            e
                        );
                        std::thread::sleep(Duration::from_millis(jitter));
                    }
                    other => return other,
                }
            }
        })
        .await
        .map_err(|e| PersistError::Backend(e.into()))?
    }

    // ---------------- Tokens ----------------

    /// Insert a token row along with its `create` history entry in one
    /// transaction. A duplicate (username, token_name) pair fails with
    /// [`PersistError::Duplicate`].
    pub async fn insert_token(
        &self,
        row: TokenRow,
        history: HistoryEntry,
    ) -> Result<(), PersistError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            insert_history(&tx, &history)?;
            tx.execute(
                r#"
                INSERT INTO token(key, hash, username, kind, token_name, scopes, created, expires, parent)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    row.key,
                    row.hash,
                    row.username,
                    row.kind.as_str(),
                    row.token_name,
                    row.scopes_column(),
                    row.created.timestamp(),
                    row.expires.map(|e| e.timestamp()),
                    row.parent,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_token(&self, key: String) -> Result<Option<TokenRow>, PersistError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT key, hash, username, kind, token_name, scopes, created, expires, parent
                   FROM token WHERE key = ?1"#,
            )?;
            let row = stmt
                .query_row(params![key], token_row_mapper)
                .optional()?
                .transpose()
                .map_err(PersistError::Backend)?;
            Ok(row)
        })
        .await
    }

    pub async fn list_tokens(
        &self,
        username: Option<String>,
    ) -> Result<Vec<TokenRow>, PersistError> {
        self.call(move |conn| {
            let (sql, filter) = match &username {
                Some(user) => (
                    r#"SELECT key, hash, username, kind, token_name, scopes, created, expires, parent
                       FROM token WHERE username = ?1 ORDER BY created DESC"#,
                    Some(user.clone()),
                ),
                None => (
                    r#"SELECT key, hash, username, kind, token_name, scopes, created, expires, parent
                       FROM token ORDER BY created DESC"#,
                    None,
                ),
            };
            let mut stmt = conn.prepare(sql)?;
            let mut rows = match filter {
                Some(user) => stmt.query(params![user])?,
                None => stmt.query([])?,
            };
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                match token_row_from_row(row) {
                    Ok(parsed) => out.push(parsed),
                    Err(e) => tracing::warn!(error=%e, "Skipping malformed token row"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// Apply an update to a token row and write the `edit` history entry in
    /// the same transaction. Returns the updated row, or `None` when the
    /// token does not exist.
    pub async fn update_token(
        &self,
        key: String,
        update: TokenRowUpdate,
        actor: String,
        ip: Option<String>,
    ) -> Result<Option<TokenRow>, PersistError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let current = {
                let mut stmt = tx.prepare(
                    r#"SELECT key, hash, username, kind, token_name, scopes, created, expires, parent
                       FROM token WHERE key = ?1"#,
                )?;
                stmt.query_row(params![key], token_row_mapper)
                    .optional()?
                    .transpose()
                    .map_err(PersistError::Backend)?
            };
            let Some(current) = current else {
                return Ok(None);
            };

            let mut updated = current.clone();
            if let Some(scopes) = &update.scopes {
                updated.scopes = scopes.clone();
            }
            if let Some(token_name) = &update.token_name {
                updated.token_name = token_name.clone();
            }
            if let Some(expires) = update.expires {
                updated.expires = expires;
            }

            let history = HistoryEntry::new(&key, &actor, HistoryAction::Edit, ip.as_deref())
                .with_before(current.mutable_fields())
                .with_after(updated.mutable_fields());
            insert_history(&tx, &history)?;

            tx.execute(
                r#"UPDATE token SET token_name = ?1, scopes = ?2, expires = ?3 WHERE key = ?4"#,
                params![
                    updated.token_name,
                    updated.scopes_column(),
                    updated.expires.map(|e| e.timestamp()),
                    key,
                ],
            )?;
            tx.commit()?;
            Ok(Some(updated))
        })
        .await
    }

    /// Delete a set of token rows, writing one history entry per row, all in
    /// a single transaction. Returns the number of rows actually deleted.
    pub async fn delete_tokens(
        &self,
        entries: Vec<HistoryEntry>,
    ) -> Result<usize, PersistError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            for entry in &entries {
                let n = tx.execute(
                    r#"DELETE FROM token WHERE key = ?1"#,
                    params![entry.token_key],
                )?;
                if n > 0 {
                    deleted += n;
                    insert_history(&tx, entry)?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// All transitive descendants of a token, via a recursive walk of the
    /// parent references.
    pub async fn descendants_of(&self, key: String) -> Result<Vec<String>, PersistError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                WITH RECURSIVE descendants(key) AS (
                    SELECT key FROM token WHERE parent = ?1
                    UNION
                    SELECT t.key FROM token t JOIN descendants d ON t.parent = d.key
                )
                SELECT key FROM descendants
                "#,
            )?;
            let keys = stmt
                .query_map(params![key], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    pub async fn expired_tokens(&self, now_epoch: i64) -> Result<Vec<TokenRow>, PersistError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT key, hash, username, kind, token_name, scopes, created, expires, parent
                   FROM token WHERE expires IS NOT NULL AND expires <= ?1"#,
            )?;
            let mut rows = stmt.query(params![now_epoch])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                match token_row_from_row(row) {
                    Ok(parsed) => out.push(parsed),
                    Err(e) => tracing::warn!(error=%e, "Skipping malformed token row"),
                }
            }
            Ok(out)
        })
        .await
    }

    // ---------------- History ----------------

    pub async fn history_for(&self, key: String) -> Result<Vec<HistoryEntry>, PersistError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT token_key, actor, action, timestamp, ip, before, after
                   FROM token_change_history WHERE token_key = ?1 ORDER BY timestamp, id"#,
            )?;
            let mut rows = stmt.query(params![key])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let entry = HistoryEntry::from_db_row(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                )
                .map_err(PersistError::Backend)?;
                out.push(entry);
            }
            Ok(out)
        })
        .await
    }

    // ---------------- Admins ----------------

    pub async fn list_admins(&self) -> Result<Vec<String>, PersistError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(r#"SELECT username FROM admin ORDER BY username"#)?;
            let admins = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(admins)
        })
        .await
    }

    pub async fn is_admin(&self, username: String) -> Result<bool, PersistError> {
        self.call(move |conn| {
            let found: Option<String> = conn
                .query_row(
                    r#"SELECT username FROM admin WHERE username = ?1"#,
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Add an admin. Returns false when the username was already present.
    pub async fn add_admin(&self, username: String) -> Result<bool, PersistError> {
        self.call(move |conn| {
            let n = conn.execute(
                r#"INSERT OR IGNORE INTO admin(username) VALUES(?1)"#,
                params![username],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Remove an admin. Returns false when the username was not present.
    pub async fn remove_admin(&self, username: String) -> Result<bool, PersistError> {
        self.call(move |conn| {
            let n = conn.execute(
                r#"DELETE FROM admin WHERE username = ?1"#,
                params![username],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Seed the admin table from configuration. Only runs when the table is
    /// empty so API-driven changes are not overwritten on restart.
    pub async fn seed_admins(&self, admins: Vec<String>) -> Result<(), PersistError> {
        self.call(move |conn| {
            let count: i64 = conn.query_row(r#"SELECT COUNT(*) FROM admin"#, [], |row| row.get(0))?;
            if count > 0 {
                tracing::debug!("Admin table already populated, skipping seed");
                return Ok(());
            }
            let tx = conn.transaction()?;
            for username in &admins {
                tx.execute(
                    r#"INSERT OR IGNORE INTO admin(username) VALUES(?1)"#,
                    params![username],
                )?;
            }
            tx.commit()?;
            tracing::info!("Seeded {} initial admins", admins.len());
            Ok(())
        })
        .await
    }
}

fn insert_history(conn: &Connection, entry: &HistoryEntry) -> Result<(), PersistError> {
    conn.execute(
        r#"
        INSERT INTO token_change_history(token_key, actor, action, timestamp, ip, before, after)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            entry.token_key,
            entry.actor,
            entry.action.as_str(),
            entry.timestamp.timestamp(),
            entry.ip,
            entry
                .before
                .as_ref()
                .map(|v| v.to_string()),
            entry.after.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

type RawTokenRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
    Option<i64>,
    Option<String>,
);

fn token_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TokenRow>> {
    let raw: RawTokenRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    );
    Ok(TokenRow::from_db_row(
        raw.0, raw.1, raw.2, raw.3, raw.4, raw.5, raw.6, raw.7, raw.8,
    ))
}

fn token_row_from_row(row: &rusqlite::Row<'_>) -> Result<TokenRow> {
    token_row_mapper(row).map_err(anyhow::Error::from)?
}

/// Open a SQLite connection with settings suited to a server workload.
fn open_db_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db at {}", db_path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", 5000i64).ok(); // 5s
    Ok(conn)
}

/// Migration lock guard using advisory file locking.
///
/// Multiple workers may start concurrently; only one may run migrations at a
/// time, and the others wait for it to finish.
struct MigrationLock {
    #[cfg(unix)]
    lock: (std::fs::File, PathBuf),
}

impl MigrationLock {
    fn new(lock_path: &Path, timeout: Duration) -> Result<Self> {
        #[cfg(unix)]
        {
            let file = open_lock_file_with_retry(lock_path, timeout)?;
            tracing::debug!("Acquired migration file lock for {}", lock_path.display());
            Ok(MigrationLock {
                lock: (file, lock_path.to_path_buf()),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = (lock_path, timeout);
            Ok(MigrationLock {})
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let (file, path) = &self.lock;
            let _ = file.unlock();
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(unix)]
fn open_lock_file_with_retry(lock_path: &Path, timeout: Duration) -> Result<std::fs::File> {
    use std::thread::sleep;

    let start = Instant::now();
    loop {
        match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
        {
            Ok(f) => match f.try_lock_exclusive() {
                Ok(()) => return Ok(f),
                Err(_) => {
                    if start.elapsed() > timeout {
                        anyhow::bail!(
                            "timeout acquiring migration lock {} after {}s",
                            lock_path.display(),
                            timeout.as_secs()
                        );
                    }
                    sleep(Duration::from_millis(100));
                }
            },
            Err(e) => {
                if start.elapsed() > timeout {
                    anyhow::bail!(
                        "timeout opening migration lock file {}: {}",
                        lock_path.display(),
                        e
                    );
                }
                tracing::debug!(
                    "open migration lock {} failed (will retry): {}",
                    lock_path.display(),
                    e
                );
                sleep(Duration::from_millis(100));
            }
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent dir {}", parent.display()))?;
        if let Err(e) = set_secure_dir_permissions(parent) {
            tracing::warn!(
                "could not harden permissions on {}: {:#}",
                parent.display(),
                e
            );
        }
    }
    Ok(())
}
