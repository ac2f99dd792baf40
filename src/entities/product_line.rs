use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One finished-goods line (SKU) extracted from the export documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductLine {
    pub id: Uuid,
    /// Owning export lot.
    pub lot_id: Uuid,
    pub sku_code: String,
    pub product_name: String,
    /// Harmonized System code of the finished product.
    pub hs_code: String,
    pub quantity: Decimal,
    pub unit: String,
    /// Total line FOB value in the foreign (certificate) currency.
    pub fob_value_usd: Decimal,
    /// Original row order in the extracted table; all downstream ordering
    /// derives from it.
    pub position: u32,
}
