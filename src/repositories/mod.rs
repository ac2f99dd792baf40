use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{BomEntry, ConsumptionRecord, InventoryLot, Lot, OriginResult, ProductLine};

pub mod in_memory;

pub use in_memory::{InMemoryLotRepository, InMemoryRowRepository};

/// Storage-seam errors. The engine itself treats storage as injected; this
/// enum keeps the traits honest for backends that can actually fail.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("row missing: {0}")]
    RowMissing(String),
}

/// Store for lot aggregates.
#[async_trait]
pub trait LotRepository: Send + Sync {
    async fn insert(&self, lot: Lot) -> Result<Lot, RepositoryError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Lot>, RepositoryError>;
    async fn update(&self, lot: Lot) -> Result<Lot, RepositoryError>;
    /// Ordered by created_at, then id, so listings are reproducible.
    async fn list_by_company(&self, company_id: Uuid) -> Result<Vec<Lot>, RepositoryError>;
}

/// Store for rows scoped to one export lot (extracted tables and derived
/// artifacts). Implementations must preserve the order rows were stored in.
#[async_trait]
pub trait RowRepository<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Replaces every row of the lot in one call; the write is atomic from
    /// the caller's point of view.
    async fn replace_for_lot(&self, lot_id: Uuid, rows: Vec<T>) -> Result<(), RepositoryError>;
    async fn find_by_lot(&self, lot_id: Uuid) -> Result<Vec<T>, RepositoryError>;
    /// Returns the number of rows removed.
    async fn delete_for_lot(&self, lot_id: Uuid) -> Result<u64, RepositoryError>;
}

/// Bundle of repository handles injected into the services.
#[derive(Clone)]
pub struct Repositories {
    pub lots: Arc<dyn LotRepository>,
    pub product_lines: Arc<dyn RowRepository<ProductLine>>,
    pub bom_entries: Arc<dyn RowRepository<BomEntry>>,
    pub inventory_lots: Arc<dyn RowRepository<InventoryLot>>,
    pub consumption_records: Arc<dyn RowRepository<ConsumptionRecord>>,
    pub origin_results: Arc<dyn RowRepository<OriginResult>>,
}

impl Repositories {
    /// In-memory backend, the default for tests and the CLI.
    pub fn in_memory() -> Self {
        Self {
            lots: Arc::new(InMemoryLotRepository::new()),
            product_lines: Arc::new(InMemoryRowRepository::new()),
            bom_entries: Arc::new(InMemoryRowRepository::new()),
            inventory_lots: Arc::new(InMemoryRowRepository::new()),
            consumption_records: Arc::new(InMemoryRowRepository::new()),
            origin_results: Arc::new(InMemoryRowRepository::new()),
        }
    }
}
