//! End-to-end workflow tests over the in-memory backend.
//!
//! Each test drives a lot through real step transitions with scripted
//! extraction and rendering seams, then asserts on the persisted artifacts:
//! step checkpoints, statuses, consumption rows, origin results and report
//! references.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use origin_api::{
    config::AppConfig,
    entities::{
        ConsumptionRecord, ConsumptionStatus, FormType, GeneratedReport, JobKind, Lot, LotStatus,
        OriginResult, ReportKind, WorkflowStep,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::Repositories,
    services::{
        extraction::{
            BomRow, BomTable, ExtractedTables, JobFailure, MaterialRow, NplTable, ProductRow,
            ProductTable, ReportRenderer, TableExtractor,
        },
        workflow::{ContinueRequest, WorkflowService},
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

/// Serves the same tables on every extraction.
struct FixedExtractor {
    tables: ExtractedTables,
}

#[async_trait]
impl TableExtractor for FixedExtractor {
    async fn extract(&self, _lot: &Lot) -> Result<ExtractedTables, JobFailure> {
        Ok(self.tables.clone())
    }
}

/// Replays the scripted failures first, then serves the tables.
struct FlakyExtractor {
    failures: Mutex<VecDeque<JobFailure>>,
    tables: ExtractedTables,
}

#[async_trait]
impl TableExtractor for FlakyExtractor {
    async fn extract(&self, _lot: &Lot) -> Result<ExtractedTables, JobFailure> {
        if let Some(failure) = self.failures.lock().await.pop_front() {
            return Err(failure);
        }
        Ok(self.tables.clone())
    }
}

/// Blocks extraction until the gate fires, so tests can observe the
/// in-progress window.
struct GatedExtractor {
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    tables: ExtractedTables,
}

#[async_trait]
impl TableExtractor for GatedExtractor {
    async fn extract(&self, _lot: &Lot) -> Result<ExtractedTables, JobFailure> {
        if let Some(gate) = self.gate.lock().await.take() {
            let _ = gate.await;
        }
        Ok(self.tables.clone())
    }
}

/// Produces the two document references and counts invocations.
struct CountingRenderer {
    calls: AtomicUsize,
}

impl CountingRenderer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportRenderer for CountingRenderer {
    async fn render(
        &self,
        lot: &Lot,
        _records: &[ConsumptionRecord],
        _results: &[OriginResult],
    ) -> Result<Vec<GeneratedReport>, JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            GeneratedReport {
                kind: ReportKind::ConsumptionSheet,
                document_id: Uuid::new_v4(),
                file_name: format!("{}-consumption-sheet.json", lot.lot_number),
                generated_at: Utc::now(),
            },
            GeneratedReport {
                kind: ReportKind::OriginAssessment,
                document_id: Uuid::new_v4(),
                file_name: format!("{}-origin-assessment.json", lot.lot_number),
                generated_at: Utc::now(),
            },
        ])
    }
}

struct Harness {
    workflow: WorkflowService,
    repositories: Repositories,
    // Keeps the event channel open for the lifetime of the test.
    _rx: mpsc::Receiver<Event>,
}

fn harness(extractor: Arc<dyn TableExtractor>, renderer: Arc<dyn ReportRenderer>) -> Harness {
    let (tx, rx) = mpsc::channel(1024);
    let repositories = Repositories::in_memory();
    let workflow = WorkflowService::new(
        repositories.clone(),
        Arc::new(EventSender::new(tx)),
        extractor,
        renderer,
        &AppConfig::default(),
    );
    Harness {
        workflow,
        repositories,
        _rx: rx,
    }
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

fn product(sku: &str, hs: &str, quantity: Decimal, fob: Decimal) -> ProductRow {
    ProductRow {
        sku_code: sku.to_string(),
        product_name: format!("{} finished good", sku),
        hs_code: hs.to_string(),
        quantity,
        unit: "PCS".to_string(),
        fob_value_usd: fob,
    }
}

#[allow(clippy::too_many_arguments)]
fn material(
    code: &str,
    hs: &str,
    unit: &str,
    quantity: Decimal,
    unit_cost: Decimal,
    invoice: &str,
    invoice_date: NaiveDate,
    country: &str,
    certificate: Option<&str>,
) -> MaterialRow {
    MaterialRow {
        material_code: code.to_string(),
        material_name: format!("{} raw material", code),
        hs_code: hs.to_string(),
        unit: unit.to_string(),
        quantity,
        unit_cost_local: unit_cost,
        exchange_rate: dec!(25000),
        invoice_ref: invoice.to_string(),
        invoice_date,
        origin_country: country.to_string(),
        certificate_ref: certificate.map(str::to_string),
    }
}

fn bom_row(code: &str, hs: &str, unit: &str, norms: &[(&str, Decimal)]) -> BomRow {
    BomRow {
        material_code: code.to_string(),
        material_name: format!("{} raw material", code),
        hs_code: hs.to_string(),
        unit: unit.to_string(),
        norm_per_sku: norms.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
    }
}

/// Two SKUs over three receipts; the MDF bucket spans two receipts and both
/// SKUs, the fabric bucket is single-receipt and domestic with a certificate.
fn furniture_tables() -> ExtractedTables {
    ExtractedTables {
        product: ProductTable {
            products: vec![
                product("CHAIR-01", "940161", dec!(100), dec!(5000)),
                product("TABLE-02", "940360", dec!(50), dec!(7500)),
            ],
        },
        npl: NplTable {
            materials: vec![
                material(
                    "MDF-17",
                    "441114",
                    "M2",
                    dec!(200),
                    dec!(95000),
                    "INV-001",
                    date(2024, 1, 15),
                    "CN",
                    None,
                ),
                material(
                    "MDF-17",
                    "441114",
                    "M2",
                    dec!(150),
                    dec!(100000),
                    "INV-014",
                    date(2024, 2, 20),
                    "CN",
                    None,
                ),
                material(
                    "FAB-GR",
                    "540752",
                    "M",
                    dec!(250),
                    dec!(52000),
                    "INV-007",
                    date(2024, 2, 1),
                    "VN",
                    Some("VN-CO-2024-0113"),
                ),
            ],
        },
        bom: BomTable {
            sku_list: vec!["CHAIR-01".to_string(), "TABLE-02".to_string()],
            entries: vec![
                bom_row(
                    "MDF-17",
                    "441114",
                    "M2",
                    &[("CHAIR-01", dec!(1.2)), ("TABLE-02", dec!(3.4))],
                ),
                bom_row("FAB-GR", "540752", "M", &[("CHAIR-01", dec!(1.8))]),
            ],
        },
    }
}

/// Same BOM demand but only one MDF receipt, leaving that bucket short.
fn short_mdf_tables() -> ExtractedTables {
    let mut tables = furniture_tables();
    tables.npl.materials.retain(|m| m.invoice_ref != "INV-014");
    tables
}

/// Single zero-FOB product; allocation succeeds but value criteria cannot be
/// evaluated against it.
fn zero_fob_tables() -> ExtractedTables {
    ExtractedTables {
        product: ProductTable {
            products: vec![product("GLASS-01", "700991", dec!(10), dec!(0))],
        },
        npl: NplTable {
            materials: vec![material(
                "SAND-01",
                "250590",
                "KG",
                dec!(50),
                dec!(12000),
                "INV-003",
                date(2024, 1, 10),
                "CN",
                None,
            )],
        },
        bom: BomTable {
            sku_list: vec!["GLASS-01".to_string()],
            entries: vec![bom_row("SAND-01", "250590", "KG", &[("GLASS-01", dec!(1))])],
        },
    }
}

/// Creates a lot and walks it to the end of extraction. Returns the lot id.
async fn drive_to_extracted(h: &Harness, criterion: &str) -> Uuid {
    let lot = h
        .workflow
        .create_lot(Uuid::new_v4(), "LOT-2024-001".to_string(), vec![Uuid::new_v4()])
        .await
        .expect("create lot");
    h.workflow
        .continue_lot(lot.id, ContinueRequest::from_step(1))
        .await
        .expect("advance to criteria");
    h.workflow
        .setup_criteria(lot.id, FormType::B, criterion)
        .await
        .expect("configure criteria");
    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(2))
        .await
        .expect("start extraction");
    let extracted = outcome
        .job
        .expect("extraction job dispatched")
        .join()
        .await
        .expect("extraction completes");
    assert_eq!(extracted.status, LotStatus::Extracted);
    lot.id
}

fn quantity_total(records: &[ConsumptionRecord], material: &str) -> Decimal {
    records
        .iter()
        .filter(|r| r.material_code == material)
        .map(|r| r.quantity)
        .sum()
}

#[tokio::test]
async fn full_pipeline_reaches_export() {
    let renderer = CountingRenderer::new();
    let h = harness(
        Arc::new(FixedExtractor {
            tables: furniture_tables(),
        }),
        renderer.clone(),
    );

    let lot = h
        .workflow
        .create_lot(Uuid::new_v4(), "LOT-2024-001".to_string(), vec![Uuid::new_v4()])
        .await
        .expect("create lot");
    assert_eq!(lot.status, LotStatus::Draft);
    assert_eq!(lot.current_step, WorkflowStep::Upload);

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(1))
        .await
        .expect("advance to criteria");
    assert_eq!(outcome.lot.current_step, WorkflowStep::SetupCriteria);
    assert_eq!(outcome.lot.status, LotStatus::AwaitingCriteria);

    h.workflow
        .setup_criteria(lot.id, FormType::B, "RVC40")
        .await
        .expect("configure criteria");

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(2))
        .await
        .expect("start extraction");
    assert_eq!(outcome.lot.status, LotStatus::Extracting);
    assert!(outcome.lot.steps.get(WorkflowStep::Extract).in_progress);
    let job = outcome.job.expect("extraction job");
    assert_eq!(job.label(), "extraction");
    let extracted = job.join().await.expect("extraction completes");
    assert_eq!(extracted.status, LotStatus::Extracted);
    assert!(extracted.steps.get(WorkflowStep::Extract).completed);

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(3))
        .await
        .expect("run calculation");
    assert!(outcome.warnings.is_empty(), "no shortages expected");
    assert_eq!(outcome.lot.current_step, WorkflowStep::Calculate);
    assert_eq!(outcome.lot.status, LotStatus::Calculated);
    let job = outcome.job.expect("report job");
    assert_eq!(job.label(), "report-generation");
    let rendered = job.join().await.expect("reports render");
    assert_eq!(rendered.status, LotStatus::ReportsReady);
    assert_eq!(rendered.generated_reports.len(), 2);
    assert_eq!(renderer.calls(), 1);

    let records = h
        .repositories
        .consumption_records
        .find_by_lot(lot.id)
        .await
        .expect("load records");
    assert_eq!(records.len(), 5, "two MDF receipts times two SKUs plus one fabric row");
    assert!(records.iter().all(|r| r.status == ConsumptionStatus::Allocated));
    assert_eq!(quantity_total(&records, "MDF-17"), dec!(290));
    assert_eq!(quantity_total(&records, "FAB-GR"), dec!(180));

    let results = h
        .repositories
        .origin_results
        .find_by_lot(lot.id)
        .await
        .expect("load results");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.qualified));
    assert!(results.iter().all(|r| r.percentage >= dec!(40)));

    // Reports already exist, so step 4 to 5 adopts them without a new render.
    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(4))
        .await
        .expect("advance to reports");
    assert!(outcome.job.is_none());
    assert_eq!(outcome.lot.current_step, WorkflowStep::GenerateReports);
    assert_eq!(outcome.lot.status, LotStatus::ReportsReady);
    assert_eq!(renderer.calls(), 1);

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(5))
        .await
        .expect("advance to review");
    assert_eq!(outcome.lot.status, LotStatus::InReview);

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(6))
        .await
        .expect("export");
    assert_eq!(outcome.lot.status, LotStatus::Exported);
    assert_eq!(outcome.lot.current_step, WorkflowStep::Export);
    assert!(outcome.lot.steps.get(WorkflowStep::Export).completed);

    let err = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::default())
        .await
        .expect_err("exported lot has no further step");
    assert_matches!(err, ServiceError::PreconditionFailed(_));
}

#[tokio::test]
async fn extraction_failure_parks_lot_and_retry_recovers() {
    let h = harness(
        Arc::new(FlakyExtractor {
            failures: Mutex::new(VecDeque::from([JobFailure::new(
                JobKind::NplTable,
                "materials sheet unreadable",
            )])),
            tables: furniture_tables(),
        }),
        CountingRenderer::new(),
    );

    let lot = h
        .workflow
        .create_lot(Uuid::new_v4(), "LOT-2024-002".to_string(), vec![Uuid::new_v4()])
        .await
        .expect("create lot");
    h.workflow
        .continue_lot(lot.id, ContinueRequest::from_step(1))
        .await
        .expect("advance to criteria");
    h.workflow
        .setup_criteria(lot.id, FormType::D, "CTC")
        .await
        .expect("configure criteria");

    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(2))
        .await
        .expect("start extraction");
    let failed = outcome
        .job
        .expect("extraction job")
        .join()
        .await
        .expect("completion transition itself succeeds");
    assert_eq!(failed.status, LotStatus::ExtractionFailed);
    assert_eq!(failed.current_step, WorkflowStep::Extract);
    let step = failed.steps.get(WorkflowStep::Extract);
    assert!(!step.in_progress);
    assert!(!step.completed);
    assert_eq!(step.errors.len(), 1);
    assert_eq!(step.errors[0].job, JobKind::NplTable);
    assert!(step.errors[0].message.contains("materials sheet unreadable"));

    // The lot cannot move forward while parked in the failed status.
    let err = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(3))
        .await
        .expect_err("calculation refuses a failed extraction");
    assert_matches!(err, ServiceError::PreconditionFailed(_));

    let outcome = h.workflow.retry(lot.id).await.expect("retry dispatches");
    assert_eq!(outcome.lot.status, LotStatus::Extracting);
    let recovered = outcome
        .job
        .expect("retry job")
        .join()
        .await
        .expect("second extraction succeeds");
    assert_eq!(recovered.status, LotStatus::Extracted);
    let step = recovered.steps.get(WorkflowStep::Extract);
    assert!(step.completed);
    assert!(step.errors.is_empty(), "retry clears the old step errors");

    h.workflow
        .continue_lot(lot.id, ContinueRequest::from_step(3))
        .await
        .expect("calculation runs after recovery");
}

#[tokio::test]
async fn shortage_bucket_allocates_nothing_but_run_continues() {
    let h = harness(
        Arc::new(FixedExtractor {
            tables: short_mdf_tables(),
        }),
        CountingRenderer::new(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;

    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("calculation tolerates the shortage");
    assert_eq!(outcome.lot.status, LotStatus::ShortageDetected);
    assert_eq!(outcome.warnings.len(), 1);
    let shortage = &outcome.warnings[0];
    assert_eq!(shortage.material_code, "MDF-17");
    assert_eq!(shortage.required, dec!(290));
    assert_eq!(shortage.available, dec!(200));

    let rendered = outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");
    assert_eq!(rendered.status, LotStatus::ReportsReady);
    assert_eq!(rendered.stock_shortages.len(), 1, "shortage stays on the lot");

    // The short bucket allocated nothing; the healthy bucket is untouched.
    let records = h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("load records");
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.material_code == "FAB-GR"));
    assert_eq!(quantity_total(&records, "FAB-GR"), dec!(180));
}

#[tokio::test]
async fn evaluation_failure_keeps_lot_on_calculate_with_error() {
    let h = harness(
        Arc::new(FixedExtractor {
            tables: zero_fob_tables(),
        }),
        CountingRenderer::new(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;

    let err = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect_err("value criterion cannot divide by a zero FOB");
    assert_matches!(err, ServiceError::ComputationError(_));

    let lot = h.workflow.get_lot(lot_id).await.expect("load lot");
    assert_eq!(lot.status, LotStatus::CalculationFailed);
    assert_eq!(lot.current_step, WorkflowStep::Extract, "step does not advance");
    let step = lot.steps.get(WorkflowStep::Calculate);
    assert!(!step.completed);
    assert_eq!(step.errors.len(), 1);
    assert_eq!(step.errors[0].job, JobKind::OriginReport);

    // Allocation ran before the evaluator failed; its rows are kept for the
    // next attempt.
    let records = h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("load records");
    assert!(!records.is_empty());
}

#[tokio::test]
async fn calculation_recovery_adopts_existing_artifacts() {
    let renderer = CountingRenderer::new();
    let h = harness(
        Arc::new(FixedExtractor {
            tables: furniture_tables(),
        }),
        renderer.clone(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;

    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("calculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");

    let record_ids = |records: &[ConsumptionRecord]| {
        let mut ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        ids.sort();
        ids
    };
    let before = record_ids(
        &h.repositories
            .consumption_records
            .find_by_lot(lot_id)
            .await
            .expect("records before"),
    );
    let results_before: Vec<Uuid> = h
        .repositories
        .origin_results
        .find_by_lot(lot_id)
        .await
        .expect("results before")
        .iter()
        .map(|r| r.id)
        .collect();

    // Simulate a crash after the artifacts were persisted but before the lot
    // advanced: rewind the lot record alone.
    let mut lot = h
        .repositories
        .lots
        .find_by_id(lot_id)
        .await
        .expect("load lot")
        .expect("lot exists");
    lot.current_step = WorkflowStep::Extract;
    lot.steps.get_mut(WorkflowStep::Calculate).reset();
    lot.steps.get_mut(WorkflowStep::GenerateReports).reset();
    lot.status = LotStatus::Extracted;
    h.repositories.lots.update(lot).await.expect("rewind lot");

    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("recovery run");
    assert_eq!(outcome.lot.current_step, WorkflowStep::Calculate);
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render again");

    let after = record_ids(
        &h.repositories
            .consumption_records
            .find_by_lot(lot_id)
            .await
            .expect("records after"),
    );
    assert_eq!(before, after, "existing consumption rows are adopted, not rebuilt");
    let results_after: Vec<Uuid> = h
        .repositories
        .origin_results
        .find_by_lot(lot_id)
        .await
        .expect("results after")
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(results_before, results_after);
    assert_eq!(renderer.calls(), 2, "only the report render repeats");
}

#[tokio::test]
async fn rollback_to_criteria_purges_everything() {
    let h = harness(
        Arc::new(FixedExtractor {
            tables: furniture_tables(),
        }),
        CountingRenderer::new(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;
    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("calculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");

    let outcome = h
        .workflow
        .back_to_step(lot_id, 2)
        .await
        .expect("rollback to criteria");
    let lot = outcome.lot;
    assert_eq!(lot.current_step, WorkflowStep::SetupCriteria);
    assert_eq!(lot.status, LotStatus::CriteriaConfigured, "criteria survive");
    assert!(lot.criterion.is_some());
    assert!(lot.generated_reports.is_empty());
    assert!(lot.stock_shortages.is_empty());

    assert!(h
        .repositories
        .product_lines
        .find_by_lot(lot_id)
        .await
        .expect("products")
        .is_empty());
    assert!(h
        .repositories
        .inventory_lots
        .find_by_lot(lot_id)
        .await
        .expect("inventory")
        .is_empty());
    assert!(h
        .repositories
        .bom_entries
        .find_by_lot(lot_id)
        .await
        .expect("bom")
        .is_empty());
    assert!(h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("records")
        .is_empty());
    assert!(h
        .repositories
        .origin_results
        .find_by_lot(lot_id)
        .await
        .expect("results")
        .is_empty());

    // The rolled-back lot runs cleanly again.
    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(2))
        .await
        .expect("re-extract");
    outcome
        .job
        .expect("extraction job")
        .join()
        .await
        .expect("extraction completes");
    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("recalculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");
    let records = h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("records");
    assert_eq!(records.len(), 5);
}

#[tokio::test]
async fn rollback_to_extract_keeps_tables_for_recalculation() {
    let h = harness(
        Arc::new(FixedExtractor {
            tables: furniture_tables(),
        }),
        CountingRenderer::new(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;
    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("calculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");

    let outcome = h
        .workflow
        .back_to_step(lot_id, 3)
        .await
        .expect("rollback to extract");
    assert_eq!(outcome.lot.status, LotStatus::Extracted);
    assert!(outcome.lot.generated_reports.is_empty());

    let products = h
        .repositories
        .product_lines
        .find_by_lot(lot_id)
        .await
        .expect("products");
    assert_eq!(products.len(), 2, "extracted tables survive the rollback");
    assert!(h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("records")
        .is_empty());
    assert!(h
        .repositories
        .origin_results
        .find_by_lot(lot_id)
        .await
        .expect("results")
        .is_empty());

    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("recalculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");
    let records = h
        .repositories
        .consumption_records
        .find_by_lot(lot_id)
        .await
        .expect("records");
    assert_eq!(records.len(), 5);
}

#[tokio::test]
async fn in_progress_extraction_blocks_other_triggers() {
    let (gate_tx, gate_rx) = oneshot::channel();
    let h = harness(
        Arc::new(GatedExtractor {
            gate: Mutex::new(Some(gate_rx)),
            tables: furniture_tables(),
        }),
        CountingRenderer::new(),
    );

    let lot = h
        .workflow
        .create_lot(Uuid::new_v4(), "LOT-2024-003".to_string(), vec![Uuid::new_v4()])
        .await
        .expect("create lot");
    h.workflow
        .continue_lot(lot.id, ContinueRequest::from_step(1))
        .await
        .expect("advance to criteria");
    h.workflow
        .setup_criteria(lot.id, FormType::E, "WO")
        .await
        .expect("configure criteria");
    let outcome = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(2))
        .await
        .expect("start extraction");
    let job = outcome.job.expect("extraction job");

    // The sub-job is parked on the gate; every mutating entry point refuses.
    let err = h
        .workflow
        .continue_lot(lot.id, ContinueRequest::from_step(3))
        .await
        .expect_err("continue while extracting");
    assert_matches!(err, ServiceError::PreconditionFailed(_));
    let err = h
        .workflow
        .back_to_step(lot.id, 2)
        .await
        .expect_err("rollback while extracting");
    assert_matches!(err, ServiceError::PreconditionFailed(_));
    let err = h
        .workflow
        .retry(lot.id)
        .await
        .expect_err("retry while extracting");
    assert_matches!(err, ServiceError::PreconditionFailed(_));

    gate_tx.send(()).expect("release gate");
    let extracted = job.join().await.expect("extraction completes");
    assert_eq!(extracted.status, LotStatus::Extracted);

    // The rejected trigger was dropped, not queued: the lot still sits on
    // step 3 until someone continues it.
    let lot = h.workflow.get_lot(lot.id).await.expect("load lot");
    assert_eq!(lot.current_step, WorkflowStep::Extract);
}

#[tokio::test]
async fn re_generate_flag_forces_second_render() {
    let renderer = CountingRenderer::new();
    let h = harness(
        Arc::new(FixedExtractor {
            tables: furniture_tables(),
        }),
        renderer.clone(),
    );
    let lot_id = drive_to_extracted(&h, "RVC40").await;
    let outcome = h
        .workflow
        .continue_lot(lot_id, ContinueRequest::from_step(3))
        .await
        .expect("calculation");
    outcome
        .job
        .expect("report job")
        .join()
        .await
        .expect("reports render");
    assert_eq!(renderer.calls(), 1);

    let first_ids: Vec<Uuid> = h
        .workflow
        .get_lot(lot_id)
        .await
        .expect("load lot")
        .generated_reports
        .iter()
        .map(|r| r.document_id)
        .collect();

    let outcome = h
        .workflow
        .continue_lot(
            lot_id,
            ContinueRequest {
                from_step: Some(4),
                re_generate_reports: true,
            },
        )
        .await
        .expect("re-generate");
    let rendered = outcome
        .job
        .expect("new report job")
        .join()
        .await
        .expect("second render");
    assert_eq!(renderer.calls(), 2);
    assert_eq!(rendered.status, LotStatus::ReportsReady);
    let second_ids: Vec<Uuid> = rendered
        .generated_reports
        .iter()
        .map(|r| r.document_id)
        .collect();
    assert_ne!(first_ids, second_ids, "fresh documents replace the old ones");

    h.workflow
        .continue_lot(lot_id, ContinueRequest::from_step(5))
        .await
        .expect("advance to review");
}
