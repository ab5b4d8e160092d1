//! SQLite backend, driven through `tokio-rusqlite`'s connection thread.
//!
//! Each collection is a table keyed by email with the record stored as a
//! JSON document. The `candidates.exam_number` column carries a UNIQUE
//! constraint so two candidates can never share an exam number.

use crate::candidates::{CandidateStore, StoreError};
use crate::users::{UserAccount, UserStore};
use examgate_core::CandidateRecord;
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candidates (
    email       TEXT PRIMARY KEY NOT NULL,
    exam_number TEXT NOT NULL UNIQUE,
    record      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    email  TEXT PRIMARY KEY NOT NULL,
    record TEXT NOT NULL
);
";

/// Durable store backed by a single SQLite database file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).await?;
        let journal_mode = conn
            .call(|c| {
                let mode = c.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                c.execute_batch(SCHEMA)?;
                Ok(mode)
            })
            .await?;

        tracing::info!(path = %path.display(), journal_mode = %journal_mode, "candidate store opened");
        Ok(Self { conn })
    }

    /// Non-durable database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Flush and close the connection thread.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        tracing::info!("candidate store closed");
        Ok(())
    }
}

fn is_unique_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
    )
}

fn decode_candidate(email: &str, json: &str) -> Result<CandidateRecord, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::Corrupt {
        email: email.to_string(),
        source,
    })
}

impl CandidateStore for SqliteStore {
    async fn put(&self, record: CandidateRecord) -> Result<(), StoreError> {
        if !record.has_valid_key() {
            return Err(StoreError::InvalidKey);
        }

        let json = serde_json::to_string(&record)?;
        let email = record.email.clone();
        let exam_number = record.exam_number.clone();
        let updated_at = record.updated_at.to_rfc3339();

        let result = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO candidates (email, exam_number, record, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(email) DO UPDATE SET
                         exam_number = excluded.exam_number,
                         record      = excluded.record,
                         updated_at  = excluded.updated_at",
                    params![email, exam_number, json, updated_at],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    email = %record.email,
                    samples = record.embeddings.len(),
                    "candidate stored"
                );
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::ExamNumberTaken {
                exam_number: record.exam_number,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, email: &str) -> Result<Option<CandidateRecord>, StoreError> {
        let key = email.to_string();
        let json = self
            .conn
            .call(move |c| {
                let json = c
                    .query_row(
                        "SELECT record FROM candidates WHERE email = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(json)
            })
            .await?;

        json.map(|j| decode_candidate(email, &j)).transpose()
    }

    async fn get_all(&self) -> Result<Vec<CandidateRecord>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare("SELECT email, record FROM candidates ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<(String, String)>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|(email, json)| decode_candidate(email, json))
            .collect()
    }

    async fn delete(&self, email: &str) -> Result<(), StoreError> {
        let key = email.to_string();
        let removed = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM candidates WHERE email = ?1", params![key])?))
            .await?;
        tracing::debug!(email, removed, "candidate delete");
        Ok(())
    }
}

impl UserStore for SqliteStore {
    async fn put_user(&self, user: UserAccount) -> Result<(), StoreError> {
        if user.email.trim().is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let json = serde_json::to_string(&user)?;
        let email = user.email.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO users (email, record) VALUES (?1, ?2)
                     ON CONFLICT(email) DO UPDATE SET record = excluded.record",
                    params![email, json],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        let key = email.to_string();
        let json = self
            .conn
            .call(move |c| {
                let json = c
                    .query_row(
                        "SELECT record FROM users WHERE email = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(json)
            })
            .await?;

        json.map(|j| {
            serde_json::from_str(&j).map_err(|source| StoreError::Corrupt {
                email: email.to_string(),
                source,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::tests::{exercise_contract, record};
    use crate::users::Role;

    #[tokio::test]
    async fn test_contract_in_memory() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        exercise_contract(&store).await;
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_contract_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("nested/exam.db")).await.unwrap();
        exercise_contract(&store).await;
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exam.db");

        let a = record("a@x.com", "EXAM1", 0.4);
        let store = SqliteStore::open(&path).await.unwrap();
        store.put(a.clone()).await.unwrap();
        store.close().await.unwrap();

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.get("a@x.com").await.unwrap(), Some(a));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_row_reported() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .conn
            .call(|c| {
                c.execute(
                    "INSERT INTO candidates (email, exam_number, record, updated_at)
                     VALUES ('bad@x.com', 'EXAM9', '{\"email\":1}', '')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get("bad@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref email, .. } if email == "bad@x.com"));
    }

    #[tokio::test]
    async fn test_users_collection() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let admin = UserAccount::new("admin@x.com", "hunter2", Role::Admin);
        store.put_user(admin.clone()).await.unwrap();

        assert_eq!(store.get_user("admin@x.com").await.unwrap(), Some(admin));
        assert_eq!(store.get_user("ghost@x.com").await.unwrap(), None);

        // users and candidates are separate collections
        assert!(store.get("admin@x.com").await.unwrap().is_none());
    }
}
