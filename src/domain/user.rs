use async_trait::async_trait;

use super::order::RepositoryError;

/// How to reach an order's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContact {
    pub email: String,
    pub name: String,
}

/// Read-only view of the user store, used to enrich order events.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_contact(&self, user_id: i64) -> Result<Option<UserContact>, RepositoryError>;
}
