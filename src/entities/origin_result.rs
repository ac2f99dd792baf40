use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lot::OriginCriterion;

/// Per-material line of an origin assessment, in first-allocation order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialBreakdown {
    /// 1-based line number on the assessment.
    pub line_no: u32,
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    pub quantity: Decimal,
    pub value_usd: Decimal,
    pub origin_country: String,
    pub originating: bool,
    pub certificate_ref: Option<String>,
}

/// Outcome of evaluating the configured criterion for one SKU.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OriginResult {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub sku_code: String,
    pub criterion: OriginCriterion,
    pub fob_value_usd: Decimal,
    pub originating_value_usd: Decimal,
    pub non_originating_value_usd: Decimal,
    /// Value-content percentage, half-up to 2 decimals; zero when the
    /// criterion carries no percentage.
    pub percentage: Decimal,
    pub qualified: bool,
    /// Human-readable verdict naming the criterion and the deciding facts.
    pub message: String,
    pub breakdown: Vec<MaterialBreakdown>,
    pub created_at: DateTime<Utc>,
}
