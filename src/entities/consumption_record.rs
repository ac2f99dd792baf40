use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumptionStatus {
    Allocated,
    Voided,
}

/// One allocation row: a quantity of one inventory receipt consumed by one
/// SKU, with its valuation in both currencies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub sku_code: String,
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    /// The inventory receipt this quantity was taken from.
    pub inventory_lot_id: Uuid,
    pub invoice_ref: String,
    pub invoice_date: NaiveDate,
    pub quantity: Decimal,
    pub unit_cost_local: Decimal,
    /// quantity × unit_cost_local, rounded to the money scale.
    pub line_value_local: Decimal,
    pub exchange_rate: Decimal,
    /// unit_cost_local / exchange_rate, rounded to the unit-cost scale.
    pub unit_cost_usd: Decimal,
    /// quantity × unit_cost_usd, rounded to the money scale.
    pub line_value_usd: Decimal,
    /// Quantity as declared on the certificate. Starts equal to `quantity`;
    /// document rendering may override the pair independently.
    pub certificate_quantity: Decimal,
    pub certificate_unit: String,
    pub origin_country: String,
    pub certificate_ref: Option<String>,
    /// Strictly increasing per (sku_code, material bucket), FIFO order.
    pub allocation_order: u32,
    pub status: ConsumptionStatus,
    pub created_at: DateTime<Utc>,
}
