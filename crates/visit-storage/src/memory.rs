//! In-process visits table with the same matching and transaction rules as Postgres.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use visit_core::VisitRecord;

use crate::{StorageError, VisitSession, VisitStore};

#[derive(Debug, Clone, Default)]
pub struct MemoryVisitStore {
    rows: Arc<Mutex<Vec<VisitRecord>>>,
    table_ready: Arc<AtomicBool>,
    fail_queries: bool,
    fail_create: bool,
}

impl MemoryVisitStore {
    /// Sessions from this store fail every query, as a broken connection would.
    pub fn with_failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    /// `ensure_table` fails, as it would without DDL privileges.
    pub fn with_failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = VisitRecord>) {
        self.rows.lock().await.extend(records);
    }

    pub async fn rows(&self) -> Vec<VisitRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub fn table_ready(&self) -> bool {
        self.table_ready.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisitStore for MemoryVisitStore {
    type Session = MemoryVisitSession;

    async fn ensure_table(&self) -> Result<(), StorageError> {
        if self.fail_create {
            return Err(StorageError::CreateTable(sqlx::Error::Protocol(
                "permission denied for schema public".into(),
            )));
        }
        self.table_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn begin(&self) -> Result<Self::Session, StorageError> {
        Ok(MemoryVisitSession {
            store: self.clone(),
            staged: Vec::new(),
        })
    }
}

/// Writes stay staged until `commit`; dropping the session discards them.
#[derive(Debug)]
pub struct MemoryVisitSession {
    store: MemoryVisitStore,
    staged: Vec<VisitRecord>,
}

impl MemoryVisitSession {
    fn check(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.store.fail_queries {
            return Err(StorageError::Query {
                operation,
                source: sqlx::Error::Protocol(format!("{operation} rejected by memory store")),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VisitSession for MemoryVisitSession {
    async fn exists(&mut self, record: &VisitRecord) -> Result<bool, StorageError> {
        self.check("duplicate check")?;
        let rows = self.store.rows.lock().await;
        Ok(rows
            .iter()
            .chain(self.staged.iter())
            .any(|stored| stored.wildcard_matches(record)))
    }

    async fn row_count(&mut self) -> Result<i64, StorageError> {
        self.check("row count")?;
        let committed = self.store.rows.lock().await.len();
        Ok((committed + self.staged.len()) as i64)
    }

    async fn insert_rows(&mut self, records: &[VisitRecord]) -> Result<(), StorageError> {
        self.check("batch insert")?;
        self.staged.extend_from_slice(records);
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.check("commit")?;
        self.store.rows.lock().await.extend(self.staged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(value: &str) -> VisitRecord {
        VisitRecord {
            ad_bucket: Some(value.to_string()),
            ad_type: Some("search".to_string()),
            ..VisitRecord::default()
        }
    }

    #[tokio::test]
    async fn uncommitted_session_leaves_no_rows() {
        let store = MemoryVisitStore::default();
        {
            let mut session = store.begin().await.unwrap();
            session.insert_rows(&[bucket("a")]).await.unwrap();
            assert_eq!(session.row_count().await.unwrap(), 1);
        }
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn exists_uses_wildcard_rule_against_stored_rows() {
        let store = MemoryVisitStore::default();
        store
            .seed([VisitRecord {
                ad_bucket: Some("a".into()),
                ..VisitRecord::default()
            }])
            .await;

        let mut session = store.begin().await.unwrap();
        assert!(session.exists(&bucket("a")).await.unwrap());
        assert!(!session.exists(&bucket("b")).await.unwrap());
    }

    #[tokio::test]
    async fn blank_stored_row_matches_everything() {
        let store = MemoryVisitStore::default();
        store.seed([VisitRecord::default()]).await;
        let mut session = store.begin().await.unwrap();
        assert!(session.exists(&bucket("anything")).await.unwrap());
    }

    #[tokio::test]
    async fn failing_create_is_a_create_table_error() {
        let store = MemoryVisitStore::default().with_failing_create();
        let err = store.ensure_table().await.unwrap_err();
        assert!(matches!(err, StorageError::CreateTable(_)));
        assert!(!store.table_ready());
    }

    #[tokio::test]
    async fn failing_store_surfaces_query_errors() {
        let store = MemoryVisitStore::default().with_failing_queries();
        let mut session = store.begin().await.unwrap();
        let err = session.exists(&bucket("a")).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Query {
                operation: "duplicate check",
                ..
            }
        ));
    }
}
