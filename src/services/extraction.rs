//! Document extraction seam and raw-table ingestion.
//!
//! Pulling the three workbook tables (declared products, imported material
//! list, BOM norms) out of uploaded documents is delegated to a
//! [`TableExtractor`] so the workflow can run against OCR pipelines,
//! spreadsheet parsers or scripted fixtures interchangeably. Report rendering
//! sits behind the analogous [`ReportRenderer`] seam. The raw tables come
//! back as plain DTOs; [`ExtractedTables::into_entities`] validates them and
//! converts them into lot-scoped rows, assigning positions from table order.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{
    BomEntry, ConsumptionRecord, GeneratedReport, InventoryLot, JobKind, Lot, OriginResult,
    ProductLine,
};

/// Failure of an asynchronous sub-job, tagged with the table or report it was
/// producing so the recorded step error points at the offending artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job: JobKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(job: JobKind, message: impl Into<String>) -> Self {
        Self {
            job,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.job, self.message)
    }
}

/// One row of the declared product table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub sku_code: String,
    pub product_name: String,
    pub hs_code: String,
    pub quantity: Decimal,
    pub unit: String,
    pub fob_value_usd: Decimal,
}

/// Declared finished products, in workbook row order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductTable {
    pub products: Vec<ProductRow>,
}

/// One row of the imported material list (an NPL purchase line).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialRow {
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_cost_local: Decimal,
    pub exchange_rate: Decimal,
    pub invoice_ref: String,
    pub invoice_date: NaiveDate,
    pub origin_country: String,
    #[serde(default)]
    pub certificate_ref: Option<String>,
}

/// Imported material receipts, in workbook row order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NplTable {
    pub materials: Vec<MaterialRow>,
}

/// One BOM row: a material and its per-unit norm for each SKU that uses it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BomRow {
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    /// SKU code → units consumed per one unit of that SKU.
    pub norm_per_sku: BTreeMap<String, Decimal>,
}

/// BOM norms table. `sku_list` is the header row of SKU columns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BomTable {
    pub sku_list: Vec<String>,
    pub entries: Vec<BomRow>,
}

/// The three raw tables one extraction run produces for a lot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTables {
    pub product: ProductTable,
    pub npl: NplTable,
    pub bom: BomTable,
}

/// Validated rows ready for persistence under one lot.
#[derive(Clone, Debug)]
pub struct LotTables {
    pub products: Vec<ProductLine>,
    pub bom_entries: Vec<BomEntry>,
    pub inventory: Vec<InventoryLot>,
}

impl ExtractedTables {
    /// Validates the raw tables and converts them into rows for `lot_id`.
    ///
    /// Positions are assigned from row order; FIFO tie-breaking and report
    /// layout derive from them downstream. Errors carry the [`JobKind`] of
    /// the table that failed and name the offending 1-based row.
    pub fn into_entities(self, lot_id: Uuid) -> Result<LotTables, JobFailure> {
        let products = ingest_products(lot_id, self.product)?;
        let skus: HashSet<&str> = products.iter().map(|p| p.sku_code.as_str()).collect();
        let inventory = ingest_materials(lot_id, self.npl)?;
        let bom_entries = ingest_bom(lot_id, self.bom, &skus)?;
        Ok(LotTables {
            products,
            bom_entries,
            inventory,
        })
    }
}

fn ingest_products(lot_id: Uuid, table: ProductTable) -> Result<Vec<ProductLine>, JobFailure> {
    if table.products.is_empty() {
        return Err(JobFailure::new(
            JobKind::ProductTable,
            "product table has no rows",
        ));
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(table.products.len());
    for (idx, row) in table.products.into_iter().enumerate() {
        let row_no = idx + 1;
        let sku_code = row.sku_code.trim().to_string();
        if sku_code.is_empty() {
            return Err(JobFailure::new(
                JobKind::ProductTable,
                format!("product row {}: blank SKU code", row_no),
            ));
        }
        if !seen.insert(sku_code.clone()) {
            return Err(JobFailure::new(
                JobKind::ProductTable,
                format!("product row {}: duplicate SKU '{}'", row_no, sku_code),
            ));
        }
        if row.quantity <= Decimal::ZERO {
            return Err(JobFailure::new(
                JobKind::ProductTable,
                format!(
                    "product row {}: declared quantity {} must be positive",
                    row_no, row.quantity
                ),
            ));
        }
        if row.fob_value_usd < Decimal::ZERO {
            return Err(JobFailure::new(
                JobKind::ProductTable,
                format!(
                    "product row {}: FOB value {} must not be negative",
                    row_no, row.fob_value_usd
                ),
            ));
        }
        out.push(ProductLine {
            id: Uuid::new_v4(),
            lot_id,
            sku_code,
            product_name: row.product_name.trim().to_string(),
            hs_code: row.hs_code.trim().to_string(),
            quantity: row.quantity,
            unit: row.unit.trim().to_string(),
            fob_value_usd: row.fob_value_usd,
            position: idx as u32,
        });
    }
    Ok(out)
}

fn ingest_materials(lot_id: Uuid, table: NplTable) -> Result<Vec<InventoryLot>, JobFailure> {
    let mut out = Vec::with_capacity(table.materials.len());
    for (idx, row) in table.materials.into_iter().enumerate() {
        let row_no = idx + 1;
        if row.material_code.trim().is_empty() && row.material_name.trim().is_empty() {
            return Err(JobFailure::new(
                JobKind::NplTable,
                format!("material row {}: blank material code and name", row_no),
            ));
        }
        if row.quantity < Decimal::ZERO {
            return Err(JobFailure::new(
                JobKind::NplTable,
                format!(
                    "material row {}: received quantity {} must not be negative",
                    row_no, row.quantity
                ),
            ));
        }
        if row.unit_cost_local < Decimal::ZERO {
            return Err(JobFailure::new(
                JobKind::NplTable,
                format!(
                    "material row {}: unit cost {} must not be negative",
                    row_no, row.unit_cost_local
                ),
            ));
        }
        if row.exchange_rate <= Decimal::ZERO {
            return Err(JobFailure::new(
                JobKind::NplTable,
                format!(
                    "material row {}: exchange rate {} must be positive",
                    row_no, row.exchange_rate
                ),
            ));
        }
        out.push(InventoryLot {
            id: Uuid::new_v4(),
            lot_id,
            material_code: row.material_code.trim().to_string(),
            material_name: row.material_name.trim().to_string(),
            hs_code: row.hs_code.trim().to_string(),
            unit: row.unit.trim().to_string(),
            quantity: row.quantity,
            unit_cost_local: row.unit_cost_local,
            exchange_rate: row.exchange_rate,
            invoice_ref: row.invoice_ref.trim().to_string(),
            invoice_date: row.invoice_date,
            origin_country: row.origin_country.trim().to_string(),
            certificate_ref: row
                .certificate_ref
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            position: idx as u32,
        });
    }
    Ok(out)
}

fn ingest_bom(
    lot_id: Uuid,
    table: BomTable,
    product_skus: &HashSet<&str>,
) -> Result<Vec<BomEntry>, JobFailure> {
    for sku in &table.sku_list {
        if !product_skus.contains(sku.trim()) {
            return Err(JobFailure::new(
                JobKind::BomTable,
                format!(
                    "BOM header names SKU '{}' that is not in the product table",
                    sku.trim()
                ),
            ));
        }
    }
    if table.entries.is_empty() {
        return Err(JobFailure::new(JobKind::BomTable, "BOM table has no rows"));
    }
    let mut out = Vec::with_capacity(table.entries.len());
    for (idx, row) in table.entries.into_iter().enumerate() {
        let row_no = idx + 1;
        if row.material_code.trim().is_empty() && row.material_name.trim().is_empty() {
            return Err(JobFailure::new(
                JobKind::BomTable,
                format!("BOM row {}: blank material code and name", row_no),
            ));
        }
        if row.norm_per_sku.is_empty() {
            return Err(JobFailure::new(
                JobKind::BomTable,
                format!("BOM row {}: no per-SKU norms", row_no),
            ));
        }
        let mut norm_per_sku = BTreeMap::new();
        for (sku, norm) in row.norm_per_sku {
            let sku = sku.trim().to_string();
            if !product_skus.contains(sku.as_str()) {
                return Err(JobFailure::new(
                    JobKind::BomTable,
                    format!(
                        "BOM row {}: norm for SKU '{}' that is not in the product table",
                        row_no, sku
                    ),
                ));
            }
            if norm < Decimal::ZERO {
                return Err(JobFailure::new(
                    JobKind::BomTable,
                    format!(
                        "BOM row {}: norm {} for SKU '{}' must not be negative",
                        row_no, norm, sku
                    ),
                ));
            }
            norm_per_sku.insert(sku, norm);
        }
        out.push(BomEntry {
            id: Uuid::new_v4(),
            lot_id,
            material_code: row.material_code.trim().to_string(),
            material_name: row.material_name.trim().to_string(),
            hs_code: row.hs_code.trim().to_string(),
            unit: row.unit.trim().to_string(),
            norm_per_sku,
            position: idx as u32,
        });
    }
    Ok(out)
}

/// Extracts the three tables from the documents uploaded for a lot.
///
/// Implementations run inside a spawned sub-job; a returned error fails the
/// Extract step without tearing the lot down.
#[async_trait]
pub trait TableExtractor: Send + Sync {
    async fn extract(&self, lot: &Lot) -> Result<ExtractedTables, JobFailure>;
}

/// Renders the consumption sheet and origin assessment documents for a lot.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(
        &self,
        lot: &Lot,
        records: &[ConsumptionRecord],
        results: &[OriginResult],
    ) -> Result<Vec<GeneratedReport>, JobFailure>;
}
