use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::order::{Order, OrderRepository, OrderStatus, RepositoryError};
use crate::domain::user::{UserContact, UserDirectory};

// ============================================================================
// In-Memory Order Repository
// ============================================================================
//
// Process-local storage used by the binary when no database is wired in and
// by tests. A single RwLock gives row-level atomicity for updates.
//
// ============================================================================

#[derive(Default)]
struct OrderTable {
    next_id: i64,
    rows: HashMap<i64, Order>,
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    table: RwLock<OrderTable>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sorted_by_id(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by_key(|o| o.id());
    orders
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, order: Order) -> Result<Order, RepositoryError> {
        let mut table = self.table.write().await;

        if table.rows.values().any(|o| o.order_no() == order.order_no()) {
            return Err(RepositoryError::DuplicateOrderNo(order.order_no().to_string()));
        }

        table.next_id += 1;
        let stored = order.with_id(table.next_id);
        table.rows.insert(stored.id(), stored.clone());

        tracing::debug!(
            order_id = stored.id(),
            order_no = %stored.order_no(),
            "Order row inserted"
        );

        Ok(stored)
    }

    async fn update(&self, order: &Order) -> Result<(), RepositoryError> {
        let mut table = self.table.write().await;

        match table.rows.get_mut(&order.id()) {
            Some(row) => {
                *row = order.clone();
                Ok(())
            }
            None => Err(RepositoryError::Missing(order.id())),
        }
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Order>, RepositoryError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Order>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .find(|o| o.order_no() == order_no)
            .cloned())
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Order>, RepositoryError> {
        let table = self.table.read().await;
        Ok(sorted_by_id(
            table.rows.values().filter(|o| o.user_id() == user_id).cloned().collect(),
        ))
    }

    async fn find_all(&self) -> Result<Vec<Order>, RepositoryError> {
        let table = self.table.read().await;
        Ok(sorted_by_id(table.rows.values().cloned().collect()))
    }

    async fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, RepositoryError> {
        let table = self.table.read().await;
        Ok(sorted_by_id(
            table.rows.values().filter(|o| o.status() == status).cloned().collect(),
        ))
    }
}

// ============================================================================
// In-Memory User Directory
// ============================================================================

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<i64, UserContact>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: i64, contact: UserContact) {
        self.users.write().await.insert(user_id, contact);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_contact(&self, user_id: i64) -> Result<Option<UserContact>, RepositoryError> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }
}
