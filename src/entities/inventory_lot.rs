use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw-material receipt (an NPL purchase line) available for consumption.
///
/// Receipts are consumed FIFO by `invoice_date`; `position` preserves the
/// extracted row order and breaks date ties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryLot {
    pub id: Uuid,
    /// Owning export lot (receipts are scoped to the lot they were extracted
    /// for).
    pub lot_id: Uuid,
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    /// Quantity still available for allocation.
    pub quantity: Decimal,
    /// Purchase unit cost in the local currency.
    pub unit_cost_local: Decimal,
    /// Local currency units per one foreign currency unit at receipt time.
    pub exchange_rate: Decimal,
    pub invoice_ref: String,
    pub invoice_date: NaiveDate,
    /// ISO 3166-1 alpha-2 country the material originates from.
    pub origin_country: String,
    /// Preferential-origin certificate reference, when the supplier provided
    /// one.
    pub certificate_ref: Option<String>,
    pub position: u32,
}

impl InventoryLot {
    /// True when the receipt carries a usable certificate reference.
    pub fn has_certificate(&self) -> bool {
        self.certificate_ref
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }
}
