//! Login accounts (the `users` collection).
//!
//! Administrators and candidates sign in with email + password. Passwords
//! are kept as a salted SHA-256 digest, never in clear.

use crate::candidates::StoreError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;

const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub email: String,
    pub role: Role,
    salt: String,
    password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(email: impl Into<String>, password: &str, role: Role) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = hex::encode(salt);
        let password_hash = digest(&salt, password);
        Self {
            email: email.into().trim().to_string(),
            role,
            salt,
            password_hash,
            created_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn check_password(&self, password: &str) -> bool {
        let candidate = digest(&self.salt, password);
        // Compare every byte regardless of where the first mismatch is.
        candidate.len() == self.password_hash.len()
            && candidate
                .bytes()
                .zip(self.password_hash.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Keyed account collection.
pub trait UserStore: Send + Sync + 'static {
    fn put_user(&self, user: UserAccount) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_user(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<UserAccount>, StoreError>> + Send;
}

/// Look up `email` and check `password`. `Ok(None)` for unknown accounts
/// and wrong passwords alike.
pub async fn authenticate<S: UserStore>(
    store: &S,
    email: &str,
    password: &str,
) -> Result<Option<UserAccount>, StoreError> {
    let account = store.get_user(email.trim()).await?;
    Ok(account.filter(|a| a.check_password(password)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn test_password_check() {
        let user = UserAccount::new("u@x.com", "s3cret", Role::User);
        assert!(user.check_password("s3cret"));
        assert!(!user.check_password("s3cret "));
        assert!(!user.check_password(""));
        assert!(!user.is_admin());
    }

    #[test]
    fn test_salts_differ() {
        let a = UserAccount::new("a@x.com", "same", Role::User);
        let b = UserAccount::new("b@x.com", "same", Role::User);
        assert_ne!(a.password_hash, b.password_hash);
    }

    #[test]
    fn test_password_not_serialized_in_clear() {
        let user = UserAccount::new("u@x.com", "plaintext-password", Role::Admin);
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("plaintext-password"));
        assert!(json.contains("\"role\":\"admin\""));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = MemoryStore::default();
        store
            .put_user(UserAccount::new("admin@x.com", "pw", Role::Admin))
            .await
            .unwrap();

        let ok = authenticate(&store, " admin@x.com ", "pw").await.unwrap();
        assert!(ok.unwrap().is_admin());
        assert!(authenticate(&store, "admin@x.com", "nope").await.unwrap().is_none());
        assert!(authenticate(&store, "ghost@x.com", "pw").await.unwrap().is_none());
    }
}
