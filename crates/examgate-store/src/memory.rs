//! In-process store with the same semantics as the SQLite backend.

use crate::candidates::{CandidateStore, StoreError};
use crate::users::{UserAccount, UserStore};
use examgate_core::CandidateRecord;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Volatile store for tests and offline demos.
#[derive(Default)]
pub struct MemoryStore {
    candidates: RwLock<Vec<CandidateRecord>>,
    users: RwLock<HashMap<String, UserAccount>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.candidates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.candidates.read().await.is_empty()
    }
}

impl CandidateStore for MemoryStore {
    async fn put(&self, record: CandidateRecord) -> Result<(), StoreError> {
        if !record.has_valid_key() {
            return Err(StoreError::InvalidKey);
        }

        let mut candidates = self.candidates.write().await;
        if candidates
            .iter()
            .any(|r| r.exam_number == record.exam_number && r.email != record.email)
        {
            return Err(StoreError::ExamNumberTaken {
                exam_number: record.exam_number,
            });
        }

        match candidates.iter().position(|r| r.email == record.email) {
            Some(i) => candidates[i] = record,
            None => candidates.push(record),
        }
        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<CandidateRecord>, StoreError> {
        Ok(self
            .candidates
            .read()
            .await
            .iter()
            .find(|r| r.email == email)
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<CandidateRecord>, StoreError> {
        Ok(self.candidates.read().await.clone())
    }

    async fn delete(&self, email: &str) -> Result<(), StoreError> {
        self.candidates.write().await.retain(|r| r.email != email);
        Ok(())
    }
}

impl UserStore for MemoryStore {
    async fn put_user(&self, user: UserAccount) -> Result<(), StoreError> {
        if user.email.trim().is_empty() {
            return Err(StoreError::InvalidKey);
        }
        self.users.write().await.insert(user.email.clone(), user);
        Ok(())
    }

    async fn get_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.users.read().await.get(email).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::tests::exercise_contract;

    #[tokio::test]
    async fn test_contract() {
        let store = MemoryStore::new();
        exercise_contract(&store).await;
        assert_eq!(store.len().await, 1);
    }
}
