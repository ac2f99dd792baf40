//! Workflow state machine for export lots.
//!
//! Owns every transition across the seven steps, the per-step checkpoint
//! records, and the in-progress soft locks. Mutating operations on one lot id
//! are serialized through a per-lot mutex; asynchronous sub-jobs (extraction,
//! report rendering) run as spawned tasks and land back in the `complete_*`
//! callbacks, which take the same mutex. A second trigger while a sub-job is
//! in progress is rejected, never queued.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::{
    FormType, GeneratedReport, JobKind, Lot, LotStatus, OriginCriterion, StockShortage,
    WorkflowStep,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::Repositories;
use crate::services::consumption::ConsumptionService;
use crate::services::extraction::{ExtractedTables, JobFailure, ReportRenderer, TableExtractor};
use crate::services::origin::OriginEvaluationService;

/// Payload for [`WorkflowService::continue_lot`].
#[derive(Clone, Debug, Default)]
pub struct ContinueRequest {
    /// Double-submit guard: when set, the transition only runs if the lot is
    /// still sitting on this step.
    pub from_step: Option<u8>,
    /// Step 4→5 only: purge existing report references and render again.
    pub re_generate_reports: bool,
}

impl ContinueRequest {
    /// Continue guarded on the lot still being on `step`.
    pub fn from_step(step: u8) -> Self {
        Self {
            from_step: Some(step),
            re_generate_reports: false,
        }
    }
}

/// Handle on a dispatched sub-job. Callers that need the job's outcome (tests
/// and the CLI) await it; dropping the handle leaves the job running.
#[derive(Debug)]
pub struct JobHandle {
    label: &'static str,
    handle: JoinHandle<Result<Lot, ServiceError>>,
}

impl JobHandle {
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Waits for the sub-job's completion transition and returns the lot it
    /// left behind.
    pub async fn join(self) -> Result<Lot, ServiceError> {
        self.handle.await.map_err(|e| {
            ServiceError::InternalError(format!("{} job aborted: {}", self.label, e))
        })?
    }
}

/// Snapshot returned by every state-changing operation.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub lot: Lot,
    /// Stock shortages surfaced by the transition; empty for most steps.
    pub warnings: Vec<StockShortage>,
    /// Sub-job dispatched by the transition, when there is one.
    pub job: Option<JobHandle>,
}

impl TransitionOutcome {
    fn lot_only(lot: Lot) -> Self {
        Self {
            lot,
            warnings: Vec::new(),
            job: None,
        }
    }
}

/// Orchestrates the qualification workflow: step transitions, sub-job
/// dispatch and completion, rollback and retry.
#[derive(Clone)]
pub struct WorkflowService {
    repositories: Repositories,
    event_sender: Arc<EventSender>,
    extractor: Arc<dyn TableExtractor>,
    renderer: Arc<dyn ReportRenderer>,
    consumption: ConsumptionService,
    origin: OriginEvaluationService,
    /// Per-lot mutexes serializing mutating calls in-process. Cross-process
    /// locking is a caller obligation.
    lot_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl WorkflowService {
    pub fn new(
        repositories: Repositories,
        event_sender: Arc<EventSender>,
        extractor: Arc<dyn TableExtractor>,
        renderer: Arc<dyn ReportRenderer>,
        config: &AppConfig,
    ) -> Self {
        let consumption = ConsumptionService::new(
            repositories.clone(),
            event_sender.clone(),
            config.allocation_settings(),
        );
        let origin = OriginEvaluationService::new(
            repositories.clone(),
            event_sender.clone(),
            config.origin_settings(),
        );
        Self {
            repositories,
            event_sender,
            extractor,
            renderer,
            consumption,
            origin,
            lot_locks: Arc::new(DashMap::new()),
        }
    }

    /// Creates a lot at step 1 with its uploaded documents linked.
    #[instrument(skip(self, document_ids), err)]
    pub async fn create_lot(
        &self,
        company_id: Uuid,
        lot_number: String,
        document_ids: Vec<Uuid>,
    ) -> Result<Lot, ServiceError> {
        let lot_number = lot_number.trim().to_string();
        if lot_number.is_empty() {
            return Err(ServiceError::validation("lot number must not be blank"));
        }
        let lot = Lot::new(company_id, lot_number, document_ids);
        let lot = self.repositories.lots.insert(lot).await?;
        self.emit(Event::LotCreated(lot.id)).await?;
        info!(lot_id = %lot.id, lot_number = %lot.lot_number, "lot created");
        Ok(lot)
    }

    /// Read-only snapshot of a lot.
    pub async fn get_lot(&self, lot_id: Uuid) -> Result<Lot, ServiceError> {
        self.load_lot(lot_id).await
    }

    /// Lots of one company, ordered by creation time.
    pub async fn list_lots(&self, company_id: Uuid) -> Result<Vec<Lot>, ServiceError> {
        Ok(self.repositories.lots.list_by_company(company_id).await?)
    }

    /// Configures the certificate form and origin criterion. Legal only while
    /// the lot sits on step 2.
    #[instrument(skip(self), err)]
    pub async fn setup_criteria(
        &self,
        lot_id: Uuid,
        form_type: FormType,
        criterion_code: &str,
    ) -> Result<TransitionOutcome, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let mut lot = self.load_lot(lot_id).await?;
        if lot.current_step != WorkflowStep::SetupCriteria {
            return Err(ServiceError::precondition(format!(
                "criteria can only be configured on step 2, lot is on step {}",
                lot.current_step.number()
            )));
        }
        let criterion =
            OriginCriterion::parse(criterion_code).map_err(ServiceError::ValidationError)?;
        lot.form_type = Some(form_type);
        lot.criterion = Some(criterion);
        lot.status = LotStatus::CriteriaConfigured;
        let lot = self.store(lot).await?;
        self.emit(Event::CriteriaConfigured {
            lot_id,
            form_type: form_type.to_string(),
            criterion: criterion.code(),
        })
        .await?;
        info!(lot_id = %lot_id, form_type = %form_type, criterion = %criterion, "criteria configured");
        Ok(TransitionOutcome::lot_only(lot))
    }

    /// Advances the lot from its current step. Re-entrant: recovering a lot
    /// whose calculation artifacts already exist adopts them instead of
    /// recomputing.
    #[instrument(skip(self, payload), err)]
    pub async fn continue_lot(
        &self,
        lot_id: Uuid,
        payload: ContinueRequest,
    ) -> Result<TransitionOutcome, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let lot = self.load_lot(lot_id).await?;
        if let Some(from_step) = payload.from_step {
            if from_step != lot.current_step.number() {
                return Err(ServiceError::precondition(format!(
                    "continue was issued for step {} but the lot is on step {}",
                    from_step,
                    lot.current_step.number()
                )));
            }
        }
        if lot.steps.any_in_progress() {
            return Err(ServiceError::precondition(
                "a sub-job is still in progress for this lot",
            ));
        }

        match lot.current_step {
            WorkflowStep::Upload => self.advance_from_upload(lot).await,
            WorkflowStep::SetupCriteria => self.start_extraction(lot).await,
            WorkflowStep::Extract => self.run_calculation(lot).await,
            WorkflowStep::Calculate => {
                self.advance_to_reports(lot, payload.re_generate_reports).await
            }
            WorkflowStep::GenerateReports => self.advance_to_review(lot).await,
            WorkflowStep::Review => self.export(lot).await,
            WorkflowStep::Export => Err(ServiceError::precondition(
                "lot is already exported; there is no further step",
            )),
        }
    }

    /// Rolls the lot back to an earlier step, deleting the artifacts of every
    /// step strictly after the target.
    #[instrument(skip(self), err)]
    pub async fn back_to_step(
        &self,
        lot_id: Uuid,
        target: u8,
    ) -> Result<TransitionOutcome, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let mut lot = self.load_lot(lot_id).await?;
        let target_step = WorkflowStep::from_number(target)
            .filter(|s| *s != WorkflowStep::Export)
            .ok_or_else(|| {
                ServiceError::validation(format!(
                    "rollback target must be a step between 1 and 6, got {}",
                    target
                ))
            })?;
        if target >= lot.current_step.number() {
            return Err(ServiceError::validation(format!(
                "rollback target {} is not before current step {}",
                target,
                lot.current_step.number()
            )));
        }
        if lot.steps.any_in_progress() {
            return Err(ServiceError::precondition(
                "a sub-job is still in progress for this lot",
            ));
        }

        let from_step = lot.current_step.number();
        if target < 3 {
            self.purge_tables(lot_id).await?;
        }
        if target <= 3 {
            self.repositories
                .consumption_records
                .delete_for_lot(lot_id)
                .await?;
            self.repositories.origin_results.delete_for_lot(lot_id).await?;
            lot.stock_shortages.clear();
        }
        if target <= 4 {
            lot.generated_reports.clear();
        }

        lot.steps.reset_after(target_step);
        lot.current_step = target_step;
        lot.status = match target_step {
            WorkflowStep::Upload => LotStatus::Draft,
            WorkflowStep::SetupCriteria => {
                if lot.has_criteria() {
                    LotStatus::CriteriaConfigured
                } else {
                    LotStatus::AwaitingCriteria
                }
            }
            WorkflowStep::Extract => LotStatus::Extracted,
            WorkflowStep::Calculate => {
                if lot.stock_shortages.is_empty() {
                    LotStatus::Calculated
                } else {
                    LotStatus::ShortageDetected
                }
            }
            WorkflowStep::GenerateReports => LotStatus::ReportsReady,
            WorkflowStep::Review | WorkflowStep::Export => LotStatus::InReview,
        };
        let lot = self.store(lot).await?;
        self.emit(Event::LotRolledBack {
            lot_id,
            from_step,
            to_step: target,
        })
        .await?;
        info!(lot_id = %lot_id, from_step, to_step = target, "lot rolled back");
        Ok(TransitionOutcome::lot_only(lot))
    }

    /// Re-runs the failed portion of a lot parked in a step-scoped FAILED
    /// status. Clears the failed step's errors first.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, lot_id: Uuid) -> Result<TransitionOutcome, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let mut lot = self.load_lot(lot_id).await?;
        if lot.steps.any_in_progress() {
            return Err(ServiceError::precondition(
                "a sub-job is still in progress for this lot",
            ));
        }
        match lot.status {
            LotStatus::ExtractionFailed => {
                lot.steps.get_mut(WorkflowStep::Extract).reset();
                lot.steps.get_mut(WorkflowStep::Extract).in_progress = true;
                lot.status = LotStatus::Extracting;
                let lot = self.store(lot).await?;
                self.emit(Event::LotRetried { lot_id, step: 3 }).await?;
                self.emit(Event::ExtractionStarted(lot_id)).await?;
                let job = self.dispatch_extraction(lot.clone());
                Ok(TransitionOutcome {
                    lot,
                    warnings: Vec::new(),
                    job: Some(job),
                })
            }
            LotStatus::CalculationFailed => {
                lot.steps.get_mut(WorkflowStep::Calculate).reset();
                lot.status = LotStatus::Extracted;
                let lot = self.store(lot).await?;
                self.emit(Event::LotRetried { lot_id, step: 4 }).await?;
                self.run_calculation(lot).await
            }
            LotStatus::ReportGenerationFailed => {
                lot.steps.get_mut(WorkflowStep::GenerateReports).reset();
                lot.steps.get_mut(WorkflowStep::GenerateReports).in_progress = true;
                lot.generated_reports.clear();
                lot.status = if lot.stock_shortages.is_empty() {
                    LotStatus::Calculated
                } else {
                    LotStatus::ShortageDetected
                };
                let lot = self.store(lot).await?;
                self.emit(Event::LotRetried { lot_id, step: 5 }).await?;
                self.emit(Event::ReportGenerationStarted(lot_id)).await?;
                let job = self.dispatch_report_generation(lot.clone());
                Ok(TransitionOutcome {
                    lot,
                    warnings: Vec::new(),
                    job: Some(job),
                })
            }
            _ => Err(ServiceError::precondition(format!(
                "retry requires a failed status, lot is {}",
                lot.status
            ))),
        }
    }

    /// Completion callback for the extraction sub-job. Stores the validated
    /// tables or parks the lot in ExtractionFailed with the failure tagged by
    /// the offending table.
    #[instrument(skip(self, outcome), err)]
    pub async fn complete_extraction(
        &self,
        lot_id: Uuid,
        outcome: Result<ExtractedTables, JobFailure>,
    ) -> Result<Lot, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let mut lot = self.load_lot(lot_id).await?;
        if !lot.steps.get(WorkflowStep::Extract).in_progress {
            warn!(lot_id = %lot_id, "stale extraction completion ignored");
            return Ok(lot);
        }
        lot.steps.get_mut(WorkflowStep::Extract).in_progress = false;

        match outcome.and_then(|raw| raw.into_entities(lot_id)) {
            Ok(tables) => {
                let product_rows = tables.products.len();
                let material_rows = tables.inventory.len();
                let bom_rows = tables.bom_entries.len();
                self.repositories
                    .product_lines
                    .replace_for_lot(lot_id, tables.products)
                    .await?;
                self.repositories
                    .inventory_lots
                    .replace_for_lot(lot_id, tables.inventory)
                    .await?;
                self.repositories
                    .bom_entries
                    .replace_for_lot(lot_id, tables.bom_entries)
                    .await?;
                lot.steps.get_mut(WorkflowStep::Extract).completed = true;
                lot.status = LotStatus::Extracted;
                let lot = self.store(lot).await?;
                self.emit(Event::ExtractionCompleted {
                    lot_id,
                    product_rows,
                    material_rows,
                    bom_rows,
                })
                .await?;
                info!(lot_id = %lot_id, product_rows, material_rows, bom_rows, "extraction completed");
                Ok(lot)
            }
            Err(failure) => {
                lot.record_step_error(WorkflowStep::Extract, failure.job, failure.message.clone());
                lot.status = LotStatus::ExtractionFailed;
                let lot = self.store(lot).await?;
                self.emit(Event::ExtractionFailed {
                    lot_id,
                    job: failure.job,
                    message: failure.message,
                })
                .await?;
                Ok(lot)
            }
        }
    }

    /// Completion callback for the report-rendering sub-job.
    #[instrument(skip(self, outcome), err)]
    pub async fn complete_report_generation(
        &self,
        lot_id: Uuid,
        outcome: Result<Vec<GeneratedReport>, JobFailure>,
    ) -> Result<Lot, ServiceError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock().await;

        let mut lot = self.load_lot(lot_id).await?;
        if !lot.steps.get(WorkflowStep::GenerateReports).in_progress {
            warn!(lot_id = %lot_id, "stale report-generation completion ignored");
            return Ok(lot);
        }
        lot.steps.get_mut(WorkflowStep::GenerateReports).in_progress = false;

        match outcome {
            Ok(reports) => {
                let report_count = reports.len();
                lot.generated_reports = reports;
                lot.steps.get_mut(WorkflowStep::GenerateReports).completed = true;
                lot.status = LotStatus::ReportsReady;
                let lot = self.store(lot).await?;
                self.emit(Event::ReportsGenerated {
                    lot_id,
                    report_count,
                })
                .await?;
                info!(lot_id = %lot_id, report_count, "reports generated");
                Ok(lot)
            }
            Err(failure) => {
                lot.record_step_error(
                    WorkflowStep::GenerateReports,
                    failure.job,
                    failure.message.clone(),
                );
                lot.status = LotStatus::ReportGenerationFailed;
                let lot = self.store(lot).await?;
                self.emit(Event::ReportGenerationFailed {
                    lot_id,
                    message: failure.message,
                })
                .await?;
                Ok(lot)
            }
        }
    }

    // ----- step transition bodies (per-lot lock already held) -----

    async fn advance_from_upload(&self, mut lot: Lot) -> Result<TransitionOutcome, ServiceError> {
        lot.steps.get_mut(WorkflowStep::Upload).completed = true;
        lot.current_step = WorkflowStep::SetupCriteria;
        lot.status = if lot.has_criteria() {
            LotStatus::CriteriaConfigured
        } else {
            LotStatus::AwaitingCriteria
        };
        let lot = self.store(lot).await?;
        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 1,
            to_step: 2,
        })
        .await?;
        Ok(TransitionOutcome::lot_only(lot))
    }

    async fn start_extraction(&self, mut lot: Lot) -> Result<TransitionOutcome, ServiceError> {
        if !lot.has_criteria() {
            return Err(ServiceError::validation(
                "form type and origin criterion must be configured before extraction",
            ));
        }
        // Re-extraction invalidates everything computed from the old tables.
        self.purge_tables(lot.id).await?;
        self.purge_derived(&mut lot).await?;

        lot.steps.get_mut(WorkflowStep::SetupCriteria).completed = true;
        lot.steps.get_mut(WorkflowStep::Extract).reset();
        lot.steps.get_mut(WorkflowStep::Extract).in_progress = true;
        lot.steps.reset_after(WorkflowStep::Extract);
        lot.current_step = WorkflowStep::Extract;
        lot.status = LotStatus::Extracting;
        let lot = self.store(lot).await?;

        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 2,
            to_step: 3,
        })
        .await?;
        self.emit(Event::ExtractionStarted(lot.id)).await?;

        let job = self.dispatch_extraction(lot.clone());
        Ok(TransitionOutcome {
            lot,
            warnings: Vec::new(),
            job: Some(job),
        })
    }

    async fn run_calculation(&self, mut lot: Lot) -> Result<TransitionOutcome, ServiceError> {
        if lot.status == LotStatus::ExtractionFailed {
            return Err(ServiceError::precondition(
                "extraction failed for this lot; retry it first",
            ));
        }
        if !lot.steps.get(WorkflowStep::Extract).completed {
            return Err(ServiceError::precondition(
                "extraction has not completed for this lot",
            ));
        }
        let products = self.repositories.product_lines.find_by_lot(lot.id).await?;
        let entries = self.repositories.bom_entries.find_by_lot(lot.id).await?;
        if products.is_empty() || entries.is_empty() {
            return Err(ServiceError::precondition(
                "extracted tables are missing for this lot; run extraction again",
            ));
        }

        // Idempotent recovery: artifacts that already exist are adopted, not
        // recomputed.
        let existing_records = self
            .repositories
            .consumption_records
            .find_by_lot(lot.id)
            .await?;
        let warnings = if existing_records.is_empty() {
            match self.consumption.calculate_for_lot(&lot).await {
                Ok(outcome) => outcome.shortages,
                Err(err) => {
                    return self
                        .fail_calculation(lot, JobKind::ConsumptionSheet, err)
                        .await
                }
            }
        } else {
            info!(
                lot_id = %lot.id,
                records = existing_records.len(),
                "adopting existing consumption records"
            );
            lot.stock_shortages.clone()
        };

        let existing_results = self.repositories.origin_results.find_by_lot(lot.id).await?;
        if existing_results.is_empty() {
            if let Err(err) = self.origin.evaluate_for_lot(&lot).await {
                return self.fail_calculation(lot, JobKind::OriginReport, err).await;
            }
        } else {
            info!(
                lot_id = %lot.id,
                results = existing_results.len(),
                "adopting existing origin results"
            );
        }

        lot.stock_shortages = warnings.clone();
        lot.steps.get_mut(WorkflowStep::Calculate).completed = true;
        lot.current_step = WorkflowStep::Calculate;
        lot.status = if warnings.is_empty() {
            LotStatus::Calculated
        } else {
            LotStatus::ShortageDetected
        };
        lot.steps.get_mut(WorkflowStep::GenerateReports).reset();
        lot.steps.get_mut(WorkflowStep::GenerateReports).in_progress = true;
        let lot = self.store(lot).await?;

        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 3,
            to_step: 4,
        })
        .await?;
        self.emit(Event::ReportGenerationStarted(lot.id)).await?;

        let job = self.dispatch_report_generation(lot.clone());
        Ok(TransitionOutcome {
            lot,
            warnings,
            job: Some(job),
        })
    }

    async fn fail_calculation(
        &self,
        mut lot: Lot,
        job: JobKind,
        err: ServiceError,
    ) -> Result<TransitionOutcome, ServiceError> {
        let lot_id = lot.id;
        lot.record_step_error(WorkflowStep::Calculate, job, err.to_string());
        lot.status = LotStatus::CalculationFailed;
        self.store(lot).await?;
        self.emit(Event::CalculationFailed {
            lot_id,
            message: err.to_string(),
        })
        .await?;
        Err(err)
    }

    async fn advance_to_reports(
        &self,
        mut lot: Lot,
        re_generate: bool,
    ) -> Result<TransitionOutcome, ServiceError> {
        if !lot.steps.get(WorkflowStep::Calculate).completed {
            return Err(ServiceError::precondition(
                "calculation has not completed for this lot",
            ));
        }
        if lot.status == LotStatus::ReportGenerationFailed {
            return Err(ServiceError::precondition(
                "report generation failed for this lot; retry it first",
            ));
        }

        if !lot.generated_reports.is_empty() && !re_generate {
            lot.steps.get_mut(WorkflowStep::GenerateReports).completed = true;
            lot.current_step = WorkflowStep::GenerateReports;
            lot.status = LotStatus::ReportsReady;
            let lot = self.store(lot).await?;
            self.emit(Event::StepAdvanced {
                lot_id: lot.id,
                from_step: 4,
                to_step: 5,
            })
            .await?;
            return Ok(TransitionOutcome::lot_only(lot));
        }

        // First render after a rollback, or an explicit re-render. Allocation
        // is never re-run here.
        lot.generated_reports.clear();
        lot.steps.get_mut(WorkflowStep::GenerateReports).reset();
        lot.steps.get_mut(WorkflowStep::GenerateReports).in_progress = true;
        lot.current_step = WorkflowStep::GenerateReports;
        lot.status = if lot.stock_shortages.is_empty() {
            LotStatus::Calculated
        } else {
            LotStatus::ShortageDetected
        };
        let lot = self.store(lot).await?;
        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 4,
            to_step: 5,
        })
        .await?;
        self.emit(Event::ReportGenerationStarted(lot.id)).await?;

        let job = self.dispatch_report_generation(lot.clone());
        Ok(TransitionOutcome {
            lot,
            warnings: Vec::new(),
            job: Some(job),
        })
    }

    async fn advance_to_review(&self, mut lot: Lot) -> Result<TransitionOutcome, ServiceError> {
        if lot.generated_reports.is_empty() {
            return Err(ServiceError::precondition(
                "no generated reports to review",
            ));
        }
        lot.steps.get_mut(WorkflowStep::GenerateReports).completed = true;
        lot.current_step = WorkflowStep::Review;
        lot.status = LotStatus::InReview;
        let lot = self.store(lot).await?;
        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 5,
            to_step: 6,
        })
        .await?;
        Ok(TransitionOutcome::lot_only(lot))
    }

    async fn export(&self, mut lot: Lot) -> Result<TransitionOutcome, ServiceError> {
        lot.steps.get_mut(WorkflowStep::Review).completed = true;
        lot.steps.get_mut(WorkflowStep::Export).completed = true;
        lot.current_step = WorkflowStep::Export;
        lot.status = LotStatus::Exported;
        let lot = self.store(lot).await?;
        self.emit(Event::StepAdvanced {
            lot_id: lot.id,
            from_step: 6,
            to_step: 7,
        })
        .await?;
        self.emit(Event::LotExported(lot.id)).await?;
        info!(lot_id = %lot.id, "lot exported");
        Ok(TransitionOutcome::lot_only(lot))
    }

    // ----- sub-job dispatch -----

    fn dispatch_extraction(&self, lot: Lot) -> JobHandle {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let extracted = service.extractor.extract(&lot).await;
            service.complete_extraction(lot.id, extracted).await
        });
        JobHandle {
            label: "extraction",
            handle,
        }
    }

    fn dispatch_report_generation(&self, lot: Lot) -> JobHandle {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let (records, results) = future::join(
                service.repositories.consumption_records.find_by_lot(lot.id),
                service.repositories.origin_results.find_by_lot(lot.id),
            )
            .await;
            let rendered = match (records, results) {
                (Ok(records), Ok(results)) => {
                    service.renderer.render(&lot, &records, &results).await
                }
                (Err(e), _) | (_, Err(e)) => Err(JobFailure::new(
                    JobKind::ConsumptionSheet,
                    format!("loading report inputs: {}", e),
                )),
            };
            service.complete_report_generation(lot.id, rendered).await
        });
        JobHandle {
            label: "report-generation",
            handle,
        }
    }

    // ----- shared helpers -----

    fn lot_lock(&self, lot_id: Uuid) -> Arc<Mutex<()>> {
        self.lot_locks
            .entry(lot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_lot(&self, lot_id: Uuid) -> Result<Lot, ServiceError> {
        self.repositories
            .lots
            .find_by_id(lot_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("lot {}", lot_id)))
    }

    async fn store(&self, mut lot: Lot) -> Result<Lot, ServiceError> {
        lot.touch();
        Ok(self.repositories.lots.update(lot).await?)
    }

    async fn emit(&self, event: Event) -> Result<(), ServiceError> {
        self.event_sender
            .send(event)
            .await
            .map_err(ServiceError::EventError)
    }

    async fn purge_tables(&self, lot_id: Uuid) -> Result<(), ServiceError> {
        self.repositories.product_lines.delete_for_lot(lot_id).await?;
        self.repositories.bom_entries.delete_for_lot(lot_id).await?;
        self.repositories.inventory_lots.delete_for_lot(lot_id).await?;
        Ok(())
    }

    async fn purge_derived(&self, lot: &mut Lot) -> Result<(), ServiceError> {
        self.repositories
            .consumption_records
            .delete_for_lot(lot.id)
            .await?;
        self.repositories.origin_results.delete_for_lot(lot.id).await?;
        lot.stock_shortages.clear();
        lot.generated_reports.clear();
        Ok(())
    }
}
