//! Origin criterion evaluation.
//!
//! Each SKU is judged against the lot's configured criterion from its
//! aggregated consumption: per-material totals of quantity and USD value plus
//! origin country and certificate presence. Aggregation preserves
//! first-allocation order so assessment line numbers are reproducible.
//!
//! CTC and CTSH both compare 2-digit HS chapters. Trade-law definitions
//! differ on the granularity, so CTSH verdict messages name the comparison
//! level instead of silently pretending a subheading comparison happened.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::OriginSettings;
use crate::entities::{
    ConsumptionRecord, ConsumptionStatus, Lot, MaterialBreakdown, OriginCriterion, OriginResult,
    ProductLine,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::Repositories;

/// Evaluates the configured criterion for every SKU of a lot and persists the
/// per-SKU results.
#[derive(Clone)]
pub struct OriginEvaluationService {
    repositories: Repositories,
    event_sender: Arc<EventSender>,
    settings: OriginSettings,
}

impl OriginEvaluationService {
    pub fn new(
        repositories: Repositories,
        event_sender: Arc<EventSender>,
        settings: OriginSettings,
    ) -> Self {
        Self {
            repositories,
            event_sender,
            settings,
        }
    }

    /// Evaluates every SKU of the lot and replaces any previously stored
    /// results.
    #[instrument(skip(self, lot), fields(lot_id = %lot.id), err)]
    pub async fn evaluate_for_lot(&self, lot: &Lot) -> Result<Vec<OriginResult>, ServiceError> {
        let criterion = lot
            .criterion
            .ok_or_else(|| ServiceError::precondition("lot has no origin criterion configured"))?;

        let mut products = self.repositories.product_lines.find_by_lot(lot.id).await?;
        products.sort_by_key(|p| p.position);
        let records = self
            .repositories
            .consumption_records
            .find_by_lot(lot.id)
            .await?;

        let mut results = Vec::with_capacity(products.len());
        for product in &products {
            let materials =
                aggregate_materials(&records, &product.sku_code, &self.settings.domestic_country);
            let result = evaluate_sku(
                lot.id,
                criterion,
                product,
                &materials,
                self.settings.percentage_scale,
            )?;
            results.push(result);
        }

        self.repositories
            .origin_results
            .replace_for_lot(lot.id, results.clone())
            .await?;

        for result in &results {
            self.event_sender
                .send(Event::OriginEvaluated {
                    lot_id: lot.id,
                    sku_code: result.sku_code.clone(),
                    criterion: result.criterion.code(),
                    qualified: result.qualified,
                    percentage: result.percentage,
                })
                .await
                .map_err(ServiceError::EventError)?;
        }

        info!(
            lot_id = %lot.id,
            skus = results.len(),
            qualified = results.iter().filter(|r| r.qualified).count(),
            "origin evaluation stored"
        );
        Ok(results)
    }
}

/// Per-material totals for one SKU, keyed by material code and origin
/// country, in first-allocation order.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialUse {
    pub material_code: String,
    pub material_name: String,
    pub hs_code: String,
    pub unit: String,
    pub quantity: Decimal,
    pub value_usd: Decimal,
    pub origin_country: String,
    pub originating: bool,
    /// First non-blank certificate reference seen for this total.
    pub certificate_ref: Option<String>,
}

/// Folds the SKU's allocated consumption rows into per-material totals.
pub fn aggregate_materials(
    records: &[ConsumptionRecord],
    sku_code: &str,
    domestic_country: &str,
) -> Vec<MaterialUse> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut by_key: HashMap<(String, String), MaterialUse> = HashMap::new();

    for record in records
        .iter()
        .filter(|r| r.sku_code == sku_code && r.status == ConsumptionStatus::Allocated)
    {
        let key = (record.material_code.clone(), record.origin_country.clone());
        let entry = by_key.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            MaterialUse {
                material_code: record.material_code.clone(),
                material_name: record.material_name.clone(),
                hs_code: record.hs_code.clone(),
                unit: record.unit.clone(),
                quantity: Decimal::ZERO,
                value_usd: Decimal::ZERO,
                origin_country: record.origin_country.clone(),
                originating: is_domestic(&record.origin_country, domestic_country),
                certificate_ref: None,
            }
        });
        entry.quantity += record.quantity;
        entry.value_usd += record.line_value_usd;
        if entry.certificate_ref.is_none() {
            if let Some(cert) = record.certificate_ref.as_deref() {
                let cert = cert.trim();
                if !cert.is_empty() {
                    entry.certificate_ref = Some(cert.to_string());
                }
            }
        }
    }

    order.into_iter().filter_map(|k| by_key.remove(&k)).collect()
}

fn is_domestic(origin_country: &str, domestic_country: &str) -> bool {
    origin_country
        .trim()
        .eq_ignore_ascii_case(domestic_country.trim())
}

/// Evaluates one SKU against `criterion` over its aggregated material totals.
///
/// Pure and deterministic. A SKU that consumed nothing is evaluated over the
/// empty set; whatever the rule concludes from that stands.
pub fn evaluate_sku(
    lot_id: Uuid,
    criterion: OriginCriterion,
    product: &ProductLine,
    materials: &[MaterialUse],
    percentage_scale: u32,
) -> Result<OriginResult, ServiceError> {
    let originating_value: Decimal = materials
        .iter()
        .filter(|m| m.originating)
        .map(|m| m.value_usd)
        .sum();
    let non_originating_value: Decimal = materials
        .iter()
        .filter(|m| !m.originating)
        .map(|m| m.value_usd)
        .sum();

    let (qualified, percentage, message) = match criterion {
        OriginCriterion::WhollyObtained => {
            let foreign = materials.iter().filter(|m| !m.originating).count();
            if foreign == 0 {
                let message = if materials.is_empty() {
                    "WO: qualified; no material inputs were consumed".to_string()
                } else {
                    format!(
                        "WO: qualified; all {} material inputs are originating",
                        materials.len()
                    )
                };
                (true, Decimal::ZERO, message)
            } else {
                // filter above guarantees at least one foreign entry
                let first = materials.iter().find(|m| !m.originating);
                let detail = first
                    .map(|m| format!(" (first: {} from {})", m.material_code, m.origin_country))
                    .unwrap_or_default();
                (
                    false,
                    Decimal::ZERO,
                    format!(
                        "WO: not qualified; {} of {} material inputs are non-originating{}",
                        foreign,
                        materials.len(),
                        detail
                    ),
                )
            }
        }

        OriginCriterion::ChapterChange | OriginCriterion::SubheadingChange => {
            let product_chapter = hs_chapter(&product.hs_code).map_err(|e| {
                ServiceError::computation(format!("SKU {}: {}", product.sku_code, e))
            })?;
            let mut conflict: Option<&MaterialUse> = None;
            for material in materials.iter().filter(|m| !m.originating) {
                let chapter = hs_chapter(&material.hs_code).map_err(|e| {
                    ServiceError::computation(format!(
                        "material {}: {}",
                        material.material_code, e
                    ))
                })?;
                if chapter == product_chapter {
                    conflict = Some(material);
                    break;
                }
            }
            let label = criterion.code();
            let note = match criterion {
                OriginCriterion::SubheadingChange => " (compared at HS chapter level)",
                _ => "",
            };
            match conflict {
                None => (
                    true,
                    Decimal::ZERO,
                    format!(
                        "{}: qualified; no non-originating input falls in product HS chapter {}{}",
                        label, product_chapter, note
                    ),
                ),
                Some(m) => (
                    false,
                    Decimal::ZERO,
                    format!(
                        "{}: not qualified; {} (HS {}) shares product HS chapter {}{}",
                        label, m.material_code, m.hs_code, product_chapter, note
                    ),
                ),
            }
        }

        OriginCriterion::RegionalValueContent(threshold)
        | OriginCriterion::LocalValueContent(threshold) => {
            if product.fob_value_usd <= Decimal::ZERO {
                return Err(ServiceError::computation(format!(
                    "SKU {}: FOB value {} must be positive to evaluate {}",
                    product.sku_code,
                    product.fob_value_usd,
                    criterion.code()
                )));
            }
            let value_content = product
                .fob_value_usd
                .checked_sub(non_originating_value)
                .and_then(|v| v.checked_mul(Decimal::ONE_HUNDRED))
                .and_then(|v| v.checked_div(product.fob_value_usd))
                .ok_or_else(|| {
                    ServiceError::computation(format!(
                        "SKU {}: value-content arithmetic overflowed",
                        product.sku_code
                    ))
                })?;
            let percentage = round_half_up(value_content, percentage_scale);
            let qualified = percentage >= Decimal::from(threshold);
            let label = criterion.code();
            let message = if qualified {
                format!(
                    "{}: qualified; value content {}% meets threshold {}% (FOB {}, non-originating {})",
                    label, percentage, threshold, product.fob_value_usd, non_originating_value
                )
            } else {
                format!(
                    "{}: not qualified; value content {}% is below threshold {}% (FOB {}, non-originating {})",
                    label, percentage, threshold, product.fob_value_usd, non_originating_value
                )
            };
            (qualified, percentage, message)
        }

        OriginCriterion::PreferentialEntry => {
            let certified = materials
                .iter()
                .filter(|m| m.certificate_ref.is_some())
                .count();
            if certified > 0 {
                (
                    true,
                    Decimal::ZERO,
                    format!(
                        "PE: qualified; {} of {} material inputs carry a preferential-origin certificate",
                        certified,
                        materials.len()
                    ),
                )
            } else if materials.is_empty() {
                (
                    false,
                    Decimal::ZERO,
                    "PE: not qualified; no material inputs were consumed".to_string(),
                )
            } else {
                (
                    false,
                    Decimal::ZERO,
                    "PE: not qualified; no material input carries a preferential-origin certificate"
                        .to_string(),
                )
            }
        }
    };

    let breakdown = materials
        .iter()
        .enumerate()
        .map(|(idx, m)| MaterialBreakdown {
            line_no: idx as u32 + 1,
            material_code: m.material_code.clone(),
            material_name: m.material_name.clone(),
            hs_code: m.hs_code.clone(),
            unit: m.unit.clone(),
            quantity: m.quantity,
            value_usd: m.value_usd,
            origin_country: m.origin_country.clone(),
            originating: m.originating,
            certificate_ref: m.certificate_ref.clone(),
        })
        .collect();

    Ok(OriginResult {
        id: Uuid::new_v4(),
        lot_id,
        sku_code: product.sku_code.clone(),
        criterion,
        fob_value_usd: product.fob_value_usd,
        originating_value_usd: originating_value,
        non_originating_value_usd: non_originating_value,
        percentage,
        qualified,
        message,
        breakdown,
        created_at: Utc::now(),
    })
}

/// First two digits of an HS code. Dots and suffixes are tolerated, but the
/// leading two characters after trimming must be digits.
fn hs_chapter(hs_code: &str) -> Result<String, String> {
    let trimmed = hs_code.trim();
    let prefix: String = trimmed.chars().take(2).collect();
    if prefix.len() < 2 || !prefix.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("HS code '{}' has no 2-digit chapter prefix", trimmed));
    }
    Ok(prefix)
}

fn round_half_up(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}
