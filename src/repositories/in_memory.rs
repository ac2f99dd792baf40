use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LotRepository, RepositoryError, RowRepository};
use crate::entities::Lot;

/// In-memory lot store.
#[derive(Debug, Default)]
pub struct InMemoryLotRepository {
    rows: RwLock<HashMap<Uuid, Lot>>,
}

impl InMemoryLotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LotRepository for InMemoryLotRepository {
    async fn insert(&self, lot: Lot) -> Result<Lot, RepositoryError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&lot.id) {
            return Err(RepositoryError::DuplicateKey(format!("lot {}", lot.id)));
        }
        rows.insert(lot.id, lot.clone());
        Ok(lot)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Lot>, RepositoryError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn update(&self, lot: Lot) -> Result<Lot, RepositoryError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&lot.id) {
            Some(existing) => {
                *existing = lot.clone();
                Ok(lot)
            }
            None => Err(RepositoryError::RowMissing(format!("lot {}", lot.id))),
        }
    }

    async fn list_by_company(&self, company_id: Uuid) -> Result<Vec<Lot>, RepositoryError> {
        let rows = self.rows.read().await;
        let mut lots: Vec<Lot> = rows
            .values()
            .filter(|lot| lot.company_id == company_id)
            .cloned()
            .collect();
        // Explicit ordering key; HashMap iteration order must not leak out.
        lots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(lots)
    }
}

/// In-memory lot-scoped row store. Rows keep the order they were stored in.
#[derive(Debug)]
pub struct InMemoryRowRepository<T> {
    rows: RwLock<HashMap<Uuid, Vec<T>>>,
}

impl<T> InMemoryRowRepository<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryRowRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> RowRepository<T> for InMemoryRowRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn replace_for_lot(&self, lot_id: Uuid, rows: Vec<T>) -> Result<(), RepositoryError> {
        self.rows.write().await.insert(lot_id, rows);
        Ok(())
    }

    async fn find_by_lot(&self, lot_id: Uuid) -> Result<Vec<T>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .await
            .get(&lot_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_for_lot(&self, lot_id: Uuid) -> Result<u64, RepositoryError> {
        let removed = self.rows.write().await.remove(&lot_id);
        Ok(removed.map(|rows| rows.len() as u64).unwrap_or(0))
    }
}
