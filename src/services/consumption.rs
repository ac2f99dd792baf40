//! Deterministic FIFO consumption allocation.
//!
//! Demand is aggregated per material bucket from the BOM norms, matched
//! receipts are consumed oldest invoice first, and every slice is split
//! across the bucket's SKUs in proportion to their share of total demand.
//! Buckets are all-or-nothing: a bucket whose matched receipts cannot cover
//! its demand allocates zero rows and surfaces a stock shortage warning
//! instead of failing the lot.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AllocationSettings;
use crate::entities::{
    BomEntry, ConsumptionRecord, ConsumptionStatus, InventoryLot, Lot, ProductLine, StockShortage,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::Repositories;
use crate::services::matcher;

/// Allocates consumption for a lot and persists the resulting rows.
#[derive(Clone)]
pub struct ConsumptionService {
    repositories: Repositories,
    event_sender: Arc<EventSender>,
    settings: AllocationSettings,
}

impl ConsumptionService {
    pub fn new(
        repositories: Repositories,
        event_sender: Arc<EventSender>,
        settings: AllocationSettings,
    ) -> Self {
        Self {
            repositories,
            event_sender,
            settings,
        }
    }

    /// Runs the allocator over the lot's extracted tables and replaces any
    /// previously stored consumption rows.
    #[instrument(skip(self, lot), fields(lot_id = %lot.id), err)]
    pub async fn calculate_for_lot(&self, lot: &Lot) -> Result<AllocationOutcome, ServiceError> {
        let products = self.repositories.product_lines.find_by_lot(lot.id).await?;
        let entries = self.repositories.bom_entries.find_by_lot(lot.id).await?;
        let inventory = self.repositories.inventory_lots.find_by_lot(lot.id).await?;

        let outcome = allocate(lot.id, &products, &entries, &inventory, self.settings)?;

        self.repositories
            .consumption_records
            .replace_for_lot(lot.id, outcome.records.clone())
            .await?;

        for shortage in &outcome.shortages {
            warn!(
                lot_id = %lot.id,
                material_code = %shortage.material_code,
                required = %shortage.required,
                available = %shortage.available,
                "material bucket cannot be covered; allocated nothing"
            );
            self.event_sender
                .send(Event::StockShortageDetected {
                    lot_id: lot.id,
                    material_code: shortage.material_code.clone(),
                    required: shortage.required,
                    available: shortage.available,
                })
                .await
                .map_err(ServiceError::EventError)?;
        }

        self.event_sender
            .send(Event::ConsumptionCalculated {
                lot_id: lot.id,
                record_count: outcome.records.len(),
                shortage_count: outcome.shortages.len(),
            })
            .await
            .map_err(ServiceError::EventError)?;

        info!(
            lot_id = %lot.id,
            records = outcome.records.len(),
            shortages = outcome.shortages.len(),
            "consumption allocation stored"
        );
        Ok(outcome)
    }
}

/// Pure allocation over in-memory tables. Single-threaded and deterministic:
/// output order is bucket order (first BOM appearance), then receipt FIFO
/// order, then SKU position.
pub fn allocate(
    lot_id: Uuid,
    products: &[ProductLine],
    entries: &[BomEntry],
    inventory: &[InventoryLot],
    settings: AllocationSettings,
) -> Result<AllocationOutcome, ServiceError> {
    let buckets = build_buckets(products, entries, settings.quantity_scale);

    let mut records = Vec::new();
    let mut shortages = Vec::new();

    for bucket in &buckets {
        if bucket.total.is_zero() {
            continue;
        }

        // FIFO over matched receipts: invoice date, then extracted row order.
        let mut matched: Vec<&InventoryLot> = inventory
            .iter()
            .filter(|lot| matcher::matches(&bucket.entry, lot))
            .collect();
        matched.sort_by(|a, b| {
            a.invoice_date
                .cmp(&b.invoice_date)
                .then(a.position.cmp(&b.position))
        });

        let available: Decimal = matched
            .iter()
            .map(|lot| floor_to_scale(lot.quantity, settings.quantity_scale))
            .sum();
        if available < bucket.total {
            shortages.push(StockShortage {
                material_code: bucket.entry.material_code.clone(),
                material_name: bucket.entry.material_name.clone(),
                unit: bucket.entry.unit.clone(),
                required: bucket.total,
                available,
            });
            continue;
        }

        allocate_bucket(lot_id, bucket, &matched, settings, &mut records)?;
    }

    Ok(AllocationOutcome {
        bucket_count: buckets.iter().filter(|b| !b.total.is_zero()).count(),
        records,
        shortages,
    })
}

fn allocate_bucket(
    lot_id: Uuid,
    bucket: &Bucket,
    matched: &[&InventoryLot],
    settings: AllocationSettings,
    records: &mut Vec<ConsumptionRecord>,
) -> Result<(), ServiceError> {
    let demands: Vec<Decimal> = bucket.demands.iter().map(|d| d.demand).collect();
    let mut allocated = vec![Decimal::ZERO; demands.len()];
    let mut order_counters = vec![0u32; demands.len()];
    let mut remaining = bucket.total;

    for receipt in matched {
        if remaining.is_zero() {
            break;
        }
        let usable = floor_to_scale(receipt.quantity, settings.quantity_scale);
        let slice = usable.min(remaining);
        if slice <= Decimal::ZERO {
            continue;
        }
        remaining -= slice;

        let shares = if remaining.is_zero() {
            // Closing slice: hand every SKU exactly what it is still owed so
            // both per-SKU and bucket totals close exactly.
            demands
                .iter()
                .zip(&allocated)
                .map(|(demand, got)| *demand - *got)
                .collect()
        } else {
            split_slice(
                slice,
                &demands,
                bucket.total,
                &allocated,
                settings.quantity_scale,
            )
        };

        for (i, share) in shares.iter().enumerate() {
            if share.is_zero() {
                continue;
            }
            allocated[i] += *share;
            order_counters[i] += 1;
            records.push(build_record(
                lot_id,
                &bucket.demands[i].sku_code,
                receipt,
                *share,
                order_counters[i],
                settings,
            )?);
        }
    }

    Ok(())
}

fn build_record(
    lot_id: Uuid,
    sku_code: &str,
    receipt: &InventoryLot,
    quantity: Decimal,
    allocation_order: u32,
    settings: AllocationSettings,
) -> Result<ConsumptionRecord, ServiceError> {
    if receipt.exchange_rate <= Decimal::ZERO {
        return Err(ServiceError::computation(format!(
            "receipt {} ({}) has non-positive exchange rate {}",
            receipt.invoice_ref, receipt.material_code, receipt.exchange_rate
        )));
    }

    let line_value_local = round_half_up(quantity * receipt.unit_cost_local, settings.money_scale);
    let unit_cost_usd = receipt
        .unit_cost_local
        .checked_div(receipt.exchange_rate)
        .map(|c| round_half_up(c, settings.unit_cost_scale))
        .ok_or_else(|| {
            ServiceError::computation(format!(
                "unit cost conversion overflowed for receipt {}",
                receipt.invoice_ref
            ))
        })?;
    let line_value_usd = round_half_up(quantity * unit_cost_usd, settings.money_scale);

    Ok(ConsumptionRecord {
        id: Uuid::new_v4(),
        lot_id,
        sku_code: sku_code.to_string(),
        material_code: receipt.material_code.clone(),
        material_name: receipt.material_name.clone(),
        hs_code: receipt.hs_code.clone(),
        unit: receipt.unit.clone(),
        inventory_lot_id: receipt.id,
        invoice_ref: receipt.invoice_ref.clone(),
        invoice_date: receipt.invoice_date,
        quantity,
        unit_cost_local: receipt.unit_cost_local,
        line_value_local,
        exchange_rate: receipt.exchange_rate,
        unit_cost_usd,
        line_value_usd,
        certificate_quantity: quantity,
        certificate_unit: receipt.unit.clone(),
        origin_country: receipt.origin_country.clone(),
        certificate_ref: receipt.certificate_ref.clone(),
        allocation_order,
        status: ConsumptionStatus::Allocated,
        created_at: Utc::now(),
    })
}

/// Splits one receipt slice across the bucket's SKUs in proportion to their
/// original demand shares. Largest-remainder rounding at the quantity scale;
/// ties go to the lower SKU position; no SKU is pushed past its remaining
/// demand.
fn split_slice(
    slice: Decimal,
    demands: &[Decimal],
    total: Decimal,
    allocated: &[Decimal],
    scale: u32,
) -> Vec<Decimal> {
    let ulp = Decimal::new(1, scale);
    let mut shares = vec![Decimal::ZERO; demands.len()];
    let mut remainders = vec![Decimal::ZERO; demands.len()];
    let mut assigned = Decimal::ZERO;

    for i in 0..demands.len() {
        let headroom = demands[i] - allocated[i];
        if headroom <= Decimal::ZERO {
            continue;
        }
        let raw = slice * demands[i] / total;
        let mut share = floor_to_scale(raw, scale);
        if share > headroom {
            share = headroom;
        }
        remainders[i] = raw - share;
        shares[i] = share;
        assigned += share;
    }

    let mut order: Vec<usize> = (0..demands.len()).collect();
    order.sort_by(|&a, &b| remainders[b].cmp(&remainders[a]).then(a.cmp(&b)));

    let mut leftover = slice - assigned;
    while leftover >= ulp {
        let mut progressed = false;
        for &i in &order {
            if leftover < ulp {
                break;
            }
            let headroom = demands[i] - allocated[i] - shares[i];
            if headroom >= ulp {
                shares[i] += ulp;
                leftover -= ulp;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    shares
}

fn build_buckets(products: &[ProductLine], entries: &[BomEntry], scale: u32) -> Vec<Bucket> {
    let mut ordered_products: Vec<&ProductLine> = products.iter().collect();
    ordered_products.sort_by_key(|p| p.position);

    let mut ordered_entries: Vec<&BomEntry> = entries.iter().collect();
    ordered_entries.sort_by_key(|e| e.position);

    let mut buckets: Vec<Bucket> = Vec::new();
    for entry in ordered_entries {
        let key = entry.bucket_key();
        if key.is_empty() {
            continue;
        }
        let idx = match buckets.iter().position(|b| b.key == key) {
            Some(idx) => idx,
            None => {
                buckets.push(Bucket {
                    key,
                    entry: (*entry).clone(),
                    demands: Vec::new(),
                    total: Decimal::ZERO,
                });
                buckets.len() - 1
            }
        };

        for product in &ordered_products {
            let norm = match entry.norm_per_sku.get(&product.sku_code) {
                Some(norm) if *norm > Decimal::ZERO => *norm,
                _ => continue,
            };
            let demand = round_half_up(norm * product.quantity, scale);
            if demand <= Decimal::ZERO {
                continue;
            }
            let bucket = &mut buckets[idx];
            match bucket
                .demands
                .iter_mut()
                .find(|d| d.sku_code == product.sku_code)
            {
                Some(existing) => existing.demand += demand,
                None => bucket.demands.push(SkuDemand {
                    sku_code: product.sku_code.clone(),
                    position: product.position,
                    demand,
                }),
            }
            bucket.total += demand;
        }
    }

    for bucket in &mut buckets {
        bucket.demands.sort_by_key(|d| d.position);
    }
    buckets
}

fn floor_to_scale(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

fn round_half_up(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Per-SKU demand inside one material bucket, in product position order.
#[derive(Clone, Debug)]
struct SkuDemand {
    sku_code: String,
    position: u32,
    demand: Decimal,
}

#[derive(Clone, Debug)]
struct Bucket {
    key: String,
    entry: BomEntry,
    demands: Vec<SkuDemand>,
    total: Decimal,
}

/// Result of one allocation pass.
#[derive(Clone, Debug)]
pub struct AllocationOutcome {
    pub records: Vec<ConsumptionRecord>,
    pub shortages: Vec<StockShortage>,
    pub bucket_count: usize,
}

impl AllocationOutcome {
    pub fn has_shortages(&self) -> bool {
        !self.shortages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;

    fn product(sku: &str, qty: Decimal, position: u32) -> ProductLine {
        ProductLine {
            id: Uuid::new_v4(),
            lot_id: Uuid::new_v4(),
            sku_code: sku.into(),
            product_name: format!("Cabinet {}", sku),
            hs_code: "940360".into(),
            quantity: qty,
            unit: "PCS".into(),
            fob_value_usd: dec!(1000),
            position,
        }
    }

    fn bom(material: &str, norms: &[(&str, Decimal)], position: u32) -> BomEntry {
        BomEntry {
            id: Uuid::new_v4(),
            lot_id: Uuid::new_v4(),
            material_code: material.into(),
            material_name: format!("{} board", material),
            hs_code: "441114".into(),
            unit: "M2".into(),
            norm_per_sku: norms
                .iter()
                .map(|(sku, norm)| (sku.to_string(), *norm))
                .collect::<BTreeMap<_, _>>(),
            position,
        }
    }

    fn receipt(
        material: &str,
        qty: Decimal,
        date: (i32, u32, u32),
        position: u32,
    ) -> InventoryLot {
        InventoryLot {
            id: Uuid::new_v4(),
            lot_id: Uuid::new_v4(),
            material_code: material.into(),
            material_name: format!("{} board", material),
            hs_code: "441114".into(),
            unit: "M2".into(),
            quantity: qty,
            unit_cost_local: dec!(25000),
            exchange_rate: dec!(25000),
            invoice_ref: format!("INV-{}", position),
            invoice_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            origin_country: "CN".into(),
            certificate_ref: None,
            position,
        }
    }

    fn settings() -> AllocationSettings {
        AllocationSettings::default()
    }

    #[test]
    fn fifo_consumes_oldest_receipt_first() {
        let lot_id = Uuid::new_v4();
        let products = [product("SKU1", dec!(10), 0)];
        let entries = [bom("MDF", &[("SKU1", dec!(2))], 0)];
        let inventory = [
            receipt("MDF", dec!(15), (2024, 3, 10), 0),
            receipt("MDF", dec!(15), (2024, 1, 5), 1),
        ];

        let outcome = allocate(lot_id, &products, &entries, &inventory, settings()).unwrap();
        assert!(outcome.shortages.is_empty());
        assert_eq!(outcome.records.len(), 2);
        // demand 20: 15 from the January receipt, 5 from the March one
        assert_eq!(outcome.records[0].invoice_date.to_string(), "2024-01-05");
        assert_eq!(outcome.records[0].quantity, dec!(15));
        assert_eq!(outcome.records[1].invoice_date.to_string(), "2024-03-10");
        assert_eq!(outcome.records[1].quantity, dec!(5));
        assert_eq!(outcome.records[0].allocation_order, 1);
        assert_eq!(outcome.records[1].allocation_order, 2);
    }

    #[test]
    fn date_ties_break_by_row_position() {
        let products = [product("SKU1", dec!(10), 0)];
        let entries = [bom("MDF", &[("SKU1", dec!(1))], 0)];
        let inventory = [
            receipt("MDF", dec!(6), (2024, 2, 1), 4),
            receipt("MDF", dec!(6), (2024, 2, 1), 2),
        ];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].inventory_lot_id, inventory[1].id);
        assert_eq!(outcome.records[0].quantity, dec!(6));
        assert_eq!(outcome.records[1].inventory_lot_id, inventory[0].id);
        assert_eq!(outcome.records[1].quantity, dec!(4));
    }

    #[test]
    fn proportional_split_uses_largest_remainder() {
        // three SKUs with equal demand share one receipt that covers a third
        // of the bucket
        let products = [
            product("S1", dec!(1), 0),
            product("S2", dec!(1), 1),
            product("S3", dec!(1), 2),
        ];
        let entries = [bom("MDF", &[("S1", dec!(1)), ("S2", dec!(1)), ("S3", dec!(1))], 0)];
        let inventory = [
            receipt("MDF", dec!(1), (2024, 1, 1), 0),
            receipt("MDF", dec!(2), (2024, 1, 2), 1),
        ];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();

        // first slice of 1.0000 over demands [1, 1, 1]: floor gives 0.3333
        // each, the leftover ulp lands on the lowest position
        let first: Vec<Decimal> = outcome
            .records
            .iter()
            .filter(|r| r.invoice_date.to_string() == "2024-01-01")
            .map(|r| r.quantity)
            .collect();
        assert_eq!(first, vec![dec!(0.3334), dec!(0.3333), dec!(0.3333)]);

        // the closing slice hands every SKU exactly what it is still owed
        let second: Vec<Decimal> = outcome
            .records
            .iter()
            .filter(|r| r.invoice_date.to_string() == "2024-01-02")
            .map(|r| r.quantity)
            .collect();
        assert_eq!(second, vec![dec!(0.6666), dec!(0.6667), dec!(0.6667)]);

        // per-SKU totals close exactly
        for sku in ["S1", "S2", "S3"] {
            let total: Decimal = outcome
                .records
                .iter()
                .filter(|r| r.sku_code == sku)
                .map(|r| r.quantity)
                .sum();
            assert_eq!(total, dec!(1.0000));
        }
    }

    #[test]
    fn shortage_allocates_nothing_and_reports_required_vs_available() {
        let products = [product("SKU1", dec!(100), 0)];
        let entries = [bom("MDF", &[("SKU1", dec!(1))], 0)];
        let inventory = [receipt("MDF", dec!(80), (2024, 1, 1), 0)];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.shortages.len(), 1);
        assert_eq!(outcome.shortages[0].required, dec!(100));
        assert_eq!(outcome.shortages[0].available, dec!(80));
    }

    #[test]
    fn unmatched_bucket_is_a_shortage_with_zero_available() {
        let products = [product("SKU1", dec!(5), 0)];
        let entries = [bom("VENEER", &[("SKU1", dec!(2))], 0)];
        let inventory = [receipt("MDF", dec!(100), (2024, 1, 1), 0)];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.shortages.len(), 1);
        assert_eq!(outcome.shortages[0].available, Decimal::ZERO);
    }

    #[test]
    fn shortage_in_one_bucket_leaves_other_buckets_allocated() {
        let products = [product("SKU1", dec!(10), 0)];
        let entries = [
            bom("MDF", &[("SKU1", dec!(1))], 0),
            bom("VENEER", &[("SKU1", dec!(3))], 1),
        ];
        let inventory = [
            receipt("MDF", dec!(50), (2024, 1, 1), 0),
            receipt("VENEER", dec!(5), (2024, 1, 2), 1),
        ];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].material_code, "MDF");
        assert_eq!(outcome.shortages.len(), 1);
        assert_eq!(outcome.shortages[0].material_code, "VENEER");
    }

    #[test]
    fn valuation_rounds_each_derived_field() {
        let products = [product("SKU1", dec!(3), 0)];
        let entries = [bom("MDF", &[("SKU1", dec!(1))], 0)];
        let mut r = receipt("MDF", dec!(10), (2024, 1, 1), 0);
        r.unit_cost_local = dec!(23456);
        r.exchange_rate = dec!(23456);
        let inventory = [r];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        let record = &outcome.records[0];
        assert_eq!(record.quantity, dec!(3));
        assert_eq!(record.line_value_local, dec!(70368.00));
        assert_eq!(record.unit_cost_usd, dec!(1.000000));
        assert_eq!(record.line_value_usd, dec!(3.00));
        assert_eq!(record.certificate_quantity, record.quantity);
        assert_eq!(record.certificate_unit, record.unit);
    }

    #[test]
    fn non_positive_exchange_rate_is_a_computation_error() {
        let products = [product("SKU1", dec!(1), 0)];
        let entries = [bom("MDF", &[("SKU1", dec!(1))], 0)];
        let mut r = receipt("MDF", dec!(10), (2024, 1, 1), 0);
        r.exchange_rate = Decimal::ZERO;
        let inventory = [r];

        let err = allocate(Uuid::new_v4(), &products, &entries, &inventory, settings())
            .unwrap_err();
        assert!(matches!(err, ServiceError::ComputationError(_)));
    }

    #[test]
    fn demand_accumulates_across_entries_with_the_same_material() {
        let products = [product("SKU1", dec!(10), 0)];
        let entries = [
            bom("MDF", &[("SKU1", dec!(1))], 0),
            bom(" mdf ", &[("SKU1", dec!(2))], 1),
        ];
        let inventory = [receipt("MDF", dec!(100), (2024, 1, 1), 0)];

        let outcome =
            allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        assert_eq!(outcome.bucket_count, 1);
        let total: Decimal = outcome.records.iter().map(|r| r.quantity).sum();
        assert_eq!(total, dec!(30));
    }

    #[test]
    fn allocation_is_idempotent_over_identical_inputs() {
        let products = [product("S1", dec!(7), 0), product("S2", dec!(3), 1)];
        let entries = [bom("MDF", &[("S1", dec!(1.5)), ("S2", dec!(2.5))], 0)];
        let inventory = [
            receipt("MDF", dec!(9), (2024, 1, 1), 0),
            receipt("MDF", dec!(20), (2024, 2, 1), 1),
        ];

        let a = allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();
        let b = allocate(Uuid::new_v4(), &products, &entries, &inventory, settings()).unwrap();

        let key = |o: &AllocationOutcome| -> Vec<(String, Uuid, Decimal, u32)> {
            o.records
                .iter()
                .map(|r| {
                    (
                        r.sku_code.clone(),
                        r.inventory_lot_id,
                        r.quantity,
                        r.allocation_order,
                    )
                })
                .collect()
        };
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn input_order_of_receipts_does_not_change_the_result() {
        let products = [product("S1", dec!(10), 0)];
        let entries = [bom("MDF", &[("S1", dec!(2))], 0)];
        let forward = [
            receipt("MDF", dec!(12), (2024, 1, 1), 0),
            receipt("MDF", dec!(12), (2024, 2, 1), 1),
        ];
        let reversed = [forward[1].clone(), forward[0].clone()];

        let a = allocate(Uuid::new_v4(), &products, &entries, &forward, settings()).unwrap();
        let b = allocate(Uuid::new_v4(), &products, &entries, &reversed, settings()).unwrap();

        let quantities =
            |o: &AllocationOutcome| o.records.iter().map(|r| r.quantity).collect::<Vec<_>>();
        let sources = |o: &AllocationOutcome| {
            o.records
                .iter()
                .map(|r| r.invoice_date)
                .collect::<Vec<_>>()
        };
        assert_eq!(quantities(&a), quantities(&b));
        assert_eq!(sources(&a), sources(&b));
    }
}
