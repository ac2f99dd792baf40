use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One bill-of-materials line: a raw material and its consumption norm per
/// single unit of each SKU that uses it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BomEntry {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    /// SKU code → units of this material consumed per one unit of the SKU.
    /// Ordered map so iteration is reproducible.
    pub norm_per_sku: BTreeMap<String, Decimal>,
    pub position: u32,
}

impl BomEntry {
    /// Bucket key used to accumulate demand for the same material across
    /// entries: the normalized code, falling back to the normalized name for
    /// code-less rows.
    pub fn bucket_key(&self) -> String {
        let code = crate::services::matcher::normalize(&self.material_code);
        if code.is_empty() {
            crate::services::matcher::normalize(&self.material_name)
        } else {
            code
        }
    }
}
