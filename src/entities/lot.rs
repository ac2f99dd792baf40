use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The seven workflow steps an export lot moves through, in order.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStep {
    Upload,
    SetupCriteria,
    Extract,
    Calculate,
    GenerateReports,
    Review,
    Export,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 7] = [
        WorkflowStep::Upload,
        WorkflowStep::SetupCriteria,
        WorkflowStep::Extract,
        WorkflowStep::Calculate,
        WorkflowStep::GenerateReports,
        WorkflowStep::Review,
        WorkflowStep::Export,
    ];

    pub fn number(&self) -> u8 {
        match self {
            WorkflowStep::Upload => 1,
            WorkflowStep::SetupCriteria => 2,
            WorkflowStep::Extract => 3,
            WorkflowStep::Calculate => 4,
            WorkflowStep::GenerateReports => 5,
            WorkflowStep::Review => 6,
            WorkflowStep::Export => 7,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(WorkflowStep::Upload),
            2 => Some(WorkflowStep::SetupCriteria),
            3 => Some(WorkflowStep::Extract),
            4 => Some(WorkflowStep::Calculate),
            5 => Some(WorkflowStep::GenerateReports),
            6 => Some(WorkflowStep::Review),
            7 => Some(WorkflowStep::Export),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }
}

/// Lifecycle status of a lot. The `*_FAILED` statuses are step-scoped and are
/// the only entry points for `retry`; `SHORTAGE_DETECTED` is the
/// warning-flavored demotion of `CALCULATED`.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Draft,
    AwaitingCriteria,
    CriteriaConfigured,
    Extracting,
    ExtractionFailed,
    Extracted,
    CalculationFailed,
    Calculated,
    ShortageDetected,
    ReportGenerationFailed,
    ReportsReady,
    InReview,
    Exported,
}

impl LotStatus {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            LotStatus::ExtractionFailed
                | LotStatus::CalculationFailed
                | LotStatus::ReportGenerationFailed
        )
    }
}

/// Certificate-of-origin form families supported by the engine.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
pub enum FormType {
    #[strum(serialize = "B")]
    B,
    #[strum(serialize = "D")]
    D,
    #[strum(serialize = "E")]
    E,
    #[strum(serialize = "AK")]
    Ak,
    #[strum(serialize = "AJ")]
    Aj,
    #[strum(serialize = "VJ")]
    Vj,
    #[strum(serialize = "EUR.1")]
    Eur1,
    #[strum(serialize = "CPTPP")]
    Cptpp,
    #[strum(serialize = "RCEP")]
    Rcep,
}

/// Origin criterion configured for a lot. Value-content criteria carry their
/// threshold percentage as parsed from the criterion code (`RVC40` → 40).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "threshold", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginCriterion {
    WhollyObtained,
    ChapterChange,
    SubheadingChange,
    RegionalValueContent(u32),
    LocalValueContent(u32),
    PreferentialEntry,
}

impl OriginCriterion {
    /// Parses a criterion code such as `WO`, `CTC`, `CTSH`, `PE`, `RVC40` or
    /// `LVC 35`. Thresholds outside 1..=100 are rejected.
    pub fn parse(code: &str) -> Result<Self, String> {
        let canon: String = code
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        match canon.as_str() {
            "WO" => return Ok(OriginCriterion::WhollyObtained),
            "CTC" => return Ok(OriginCriterion::ChapterChange),
            "CTSH" => return Ok(OriginCriterion::SubheadingChange),
            "PE" => return Ok(OriginCriterion::PreferentialEntry),
            _ => {}
        }
        let (variant, digits) = if let Some(rest) = canon.strip_prefix("RVC") {
            ("RVC", rest)
        } else if let Some(rest) = canon.strip_prefix("LVC") {
            ("LVC", rest)
        } else {
            return Err(format!("unrecognized criterion code '{}'", code.trim()));
        };
        let threshold: u32 = digits
            .parse()
            .map_err(|_| format!("criterion '{}' has no numeric threshold", code.trim()))?;
        if !(1..=100).contains(&threshold) {
            return Err(format!(
                "criterion threshold {} out of range 1..=100",
                threshold
            ));
        }
        match variant {
            "RVC" => Ok(OriginCriterion::RegionalValueContent(threshold)),
            _ => Ok(OriginCriterion::LocalValueContent(threshold)),
        }
    }

    /// Canonical code form (`RVC40`, `CTSH`, ...).
    pub fn code(&self) -> String {
        match self {
            OriginCriterion::WhollyObtained => "WO".to_string(),
            OriginCriterion::ChapterChange => "CTC".to_string(),
            OriginCriterion::SubheadingChange => "CTSH".to_string(),
            OriginCriterion::RegionalValueContent(n) => format!("RVC{}", n),
            OriginCriterion::LocalValueContent(n) => format!("LVC{}", n),
            OriginCriterion::PreferentialEntry => "PE".to_string(),
        }
    }

    /// Threshold percentage for value-content criteria, `None` otherwise.
    pub fn threshold(&self) -> Option<u32> {
        match self {
            OriginCriterion::RegionalValueContent(n)
            | OriginCriterion::LocalValueContent(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for OriginCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Asynchronous sub-jobs a step can run. Step errors are always tagged with
/// the job that produced them.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    ProductTable,
    NplTable,
    BomTable,
    ConsumptionSheet,
    OriginReport,
}

/// One recorded sub-job failure on a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub job: JobKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Durable per-step checkpoint record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub completed: bool,
    pub in_progress: bool,
    #[serde(default)]
    pub errors: Vec<StepError>,
}

impl StepState {
    pub fn reset(&mut self) {
        self.completed = false;
        self.in_progress = false;
        self.errors.clear();
    }
}

/// Per-step records for all seven workflow steps, indexed by step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStates([StepState; 7]);

impl StepStates {
    pub fn get(&self, step: WorkflowStep) -> &StepState {
        &self.0[(step.number() - 1) as usize]
    }

    pub fn get_mut(&mut self, step: WorkflowStep) -> &mut StepState {
        &mut self.0[(step.number() - 1) as usize]
    }

    /// Resets every step record strictly after `target`.
    pub fn reset_after(&mut self, target: WorkflowStep) {
        for step in WorkflowStep::ALL {
            if step > target {
                self.get_mut(step).reset();
            }
        }
    }

    pub fn any_in_progress(&self) -> bool {
        self.0.iter().any(|s| s.in_progress)
    }
}

/// Reports the engine can produce for a lot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportKind {
    ConsumptionSheet,
    OriginAssessment,
}

/// Reference to a rendered report document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReport {
    pub kind: ReportKind,
    pub document_id: Uuid,
    pub file_name: String,
    pub generated_at: DateTime<Utc>,
}

/// One material bucket that could not be fully covered by matched inventory.
/// Shortages are warnings: the bucket allocates nothing and the lot keeps
/// moving.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StockShortage {
    pub material_code: String,
    pub material_name: String,
    pub unit: String,
    pub required: Decimal,
    pub available: Decimal,
}

/// An export lot moving through the qualification workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: Uuid,
    pub company_id: Uuid,
    pub lot_number: String,
    pub status: LotStatus,
    pub current_step: WorkflowStep,
    pub form_type: Option<FormType>,
    pub criterion: Option<OriginCriterion>,
    pub document_ids: Vec<Uuid>,
    pub steps: StepStates,
    #[serde(default)]
    pub generated_reports: Vec<GeneratedReport>,
    #[serde(default)]
    pub stock_shortages: Vec<StockShortage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lot {
    pub fn new(company_id: Uuid, lot_number: impl Into<String>, document_ids: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company_id,
            lot_number: lot_number.into(),
            status: LotStatus::Draft,
            current_step: WorkflowStep::Upload,
            form_type: None,
            criterion: None,
            document_ids,
            steps: StepStates::default(),
            generated_reports: Vec::new(),
            stock_shortages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_criteria(&self) -> bool {
        self.form_type.is_some() && self.criterion.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_step_error(&mut self, step: WorkflowStep, job: JobKind, message: String) {
        self.steps.get_mut(step).errors.push(StepError {
            job,
            message,
            occurred_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_numbers_round_trip() {
        for step in WorkflowStep::ALL {
            assert_eq!(WorkflowStep::from_number(step.number()), Some(step));
        }
        assert_eq!(WorkflowStep::from_number(0), None);
        assert_eq!(WorkflowStep::from_number(8), None);
        assert_eq!(WorkflowStep::Export.next(), None);
        assert_eq!(
            WorkflowStep::Extract.next(),
            Some(WorkflowStep::Calculate)
        );
    }

    #[test]
    fn status_strings_are_screaming_snake() {
        assert_eq!(LotStatus::ExtractionFailed.to_string(), "EXTRACTION_FAILED");
        assert_eq!(LotStatus::ShortageDetected.to_string(), "SHORTAGE_DETECTED");
        assert_eq!(
            "CALCULATION_FAILED".parse::<LotStatus>().ok(),
            Some(LotStatus::CalculationFailed)
        );
        assert!(LotStatus::ReportGenerationFailed.is_failed());
        assert!(!LotStatus::Calculated.is_failed());
    }

    #[test]
    fn form_type_codes_parse_case_insensitively() {
        assert_eq!("e".parse::<FormType>().ok(), Some(FormType::E));
        assert_eq!("EUR.1".parse::<FormType>().ok(), Some(FormType::Eur1));
        assert_eq!(FormType::Ak.to_string(), "AK");
        assert!("FORM-X".parse::<FormType>().is_err());
    }

    #[test]
    fn criterion_codes_parse() {
        assert_eq!(
            OriginCriterion::parse("RVC40"),
            Ok(OriginCriterion::RegionalValueContent(40))
        );
        assert_eq!(
            OriginCriterion::parse("lvc 35"),
            Ok(OriginCriterion::LocalValueContent(35))
        );
        assert_eq!(OriginCriterion::parse(" wo "), Ok(OriginCriterion::WhollyObtained));
        assert_eq!(OriginCriterion::parse("CTSH"), Ok(OriginCriterion::SubheadingChange));
        assert!(OriginCriterion::parse("RVC0").is_err());
        assert!(OriginCriterion::parse("RVC101").is_err());
        assert!(OriginCriterion::parse("RVC").is_err());
        assert!(OriginCriterion::parse("XYZ").is_err());
        assert_eq!(OriginCriterion::parse("RVC40").map(|c| c.code()), Ok("RVC40".to_string()));
    }

    #[test]
    fn reset_after_clears_later_steps_only() {
        let mut steps = StepStates::default();
        steps.get_mut(WorkflowStep::Extract).completed = true;
        steps.get_mut(WorkflowStep::Calculate).completed = true;
        steps.get_mut(WorkflowStep::Calculate).errors.push(StepError {
            job: JobKind::ConsumptionSheet,
            message: "boom".into(),
            occurred_at: Utc::now(),
        });
        steps.reset_after(WorkflowStep::SetupCriteria);
        assert!(!steps.get(WorkflowStep::Extract).completed);
        assert!(!steps.get(WorkflowStep::Calculate).completed);
        assert!(steps.get(WorkflowStep::Calculate).errors.is_empty());

        let mut steps = StepStates::default();
        steps.get_mut(WorkflowStep::Extract).completed = true;
        steps.get_mut(WorkflowStep::Calculate).completed = true;
        steps.reset_after(WorkflowStep::Extract);
        assert!(steps.get(WorkflowStep::Extract).completed);
        assert!(!steps.get(WorkflowStep::Calculate).completed);
    }
}
