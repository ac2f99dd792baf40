pub mod bom_entry;
pub mod consumption_record;
pub mod inventory_lot;
pub mod lot;
pub mod origin_result;
pub mod product_line;

pub use bom_entry::BomEntry;
pub use consumption_record::{ConsumptionRecord, ConsumptionStatus};
pub use inventory_lot::InventoryLot;
pub use lot::{
    FormType, GeneratedReport, JobKind, Lot, LotStatus, OriginCriterion, ReportKind, StepError,
    StepState, StepStates, StockShortage, WorkflowStep,
};
pub use origin_result::{MaterialBreakdown, OriginResult};
pub use product_line::ProductLine;
