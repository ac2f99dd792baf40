// Pure computation
pub mod matcher;

// Calculation stages
pub mod consumption;
pub mod origin;

// Extraction and rendering seams
pub mod extraction;

// Step orchestration
pub mod workflow;

pub use consumption::{allocate, AllocationOutcome, ConsumptionService};
pub use extraction::{
    BomRow, BomTable, ExtractedTables, JobFailure, LotTables, MaterialRow, NplTable, ProductRow,
    ProductTable, ReportRenderer, TableExtractor,
};
pub use origin::OriginEvaluationService;
pub use workflow::{ContinueRequest, JobHandle, TransitionOutcome, WorkflowService};
