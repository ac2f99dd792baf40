use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use origin_api::{
    config,
    entities::{
        ConsumptionRecord, FormType, GeneratedReport, JobKind, Lot, LotStatus, OriginResult,
        ReportKind, StockShortage, WorkflowStep,
    },
    events,
    services::{
        extraction::{
            BomRow, BomTable, ExtractedTables, JobFailure, MaterialRow, NplTable, ProductRow,
            ProductTable, ReportRenderer, TableExtractor,
        },
        workflow::ContinueRequest,
    },
    AppState,
};
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Qualify(args) => handle_qualify(args, cli.json).await?,
        Commands::Sample(args) => handle_sample(args).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "origin",
    about = "Certificate-of-origin qualification for export lots",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one lot through the full qualification pipeline
    Qualify(QualifyArgs),
    /// Write a sample extracted-tables file to experiment with
    Sample(SampleArgs),
}

#[derive(Args)]
struct QualifyArgs {
    /// JSON file holding the three extracted tables (see `sample`)
    #[arg(long, value_name = "PATH")]
    tables: PathBuf,
    /// Certificate form family: B, D, E, AK, AJ, VJ, EUR.1, CPTPP or RCEP
    #[arg(long, value_name = "FORM")]
    form_type: String,
    /// Origin criterion code: WO, CTC, CTSH, PE, RVC<n> or LVC<n>
    #[arg(long, value_name = "CODE")]
    criterion: String,
    /// Lot number stamped on the generated documents
    #[arg(long, default_value = "LOT-0001")]
    lot_number: String,
    /// Directory the report documents are written to (omit to skip writing)
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,
}

#[derive(Args)]
struct SampleArgs {
    /// Where to write the sample tables file
    #[arg(long, value_name = "PATH", default_value = "tables.json")]
    out: PathBuf,
}

/// Extraction seam backed by a JSON file on disk.
struct JsonFileExtractor {
    path: PathBuf,
}

#[async_trait]
impl TableExtractor for JsonFileExtractor {
    async fn extract(&self, _lot: &Lot) -> Result<ExtractedTables, JobFailure> {
        let raw = fs::read_to_string(&self.path).await.map_err(|e| {
            JobFailure::new(
                JobKind::ProductTable,
                format!("reading {}: {}", self.path.display(), e),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            JobFailure::new(
                JobKind::ProductTable,
                format!("parsing {}: {}", self.path.display(), e),
            )
        })
    }
}

/// Writes the two report documents as pretty JSON, or produces bare
/// references when no output directory is configured.
struct JsonDumpRenderer {
    out_dir: Option<PathBuf>,
}

#[async_trait]
impl ReportRenderer for JsonDumpRenderer {
    async fn render(
        &self,
        lot: &Lot,
        records: &[ConsumptionRecord],
        results: &[OriginResult],
    ) -> Result<Vec<GeneratedReport>, JobFailure> {
        let consumption = GeneratedReport {
            kind: ReportKind::ConsumptionSheet,
            document_id: Uuid::new_v4(),
            file_name: format!("{}-consumption-sheet.json", lot.lot_number),
            generated_at: Utc::now(),
        };
        let assessment = GeneratedReport {
            kind: ReportKind::OriginAssessment,
            document_id: Uuid::new_v4(),
            file_name: format!("{}-origin-assessment.json", lot.lot_number),
            generated_at: Utc::now(),
        };
        if let Some(dir) = &self.out_dir {
            write_document(dir, &consumption.file_name, records)
                .await
                .map_err(|e| JobFailure::new(JobKind::ConsumptionSheet, e))?;
            write_document(dir, &assessment.file_name, results)
                .await
                .map_err(|e| JobFailure::new(JobKind::OriginReport, e))?;
        }
        Ok(vec![consumption, assessment])
    }
}

async fn write_document<T: Serialize + ?Sized>(
    dir: &Path,
    file_name: &str,
    value: &T,
) -> Result<(), String> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("creating {}: {}", dir.display(), e))?;
    let path = dir.join(file_name);
    let body = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    fs::write(&path, body)
        .await
        .map_err(|e| format!("writing {}: {}", path.display(), e))
}

async fn handle_qualify(args: QualifyArgs, json: bool) -> Result<()> {
    let app_config = config::load_config().context("failed to load application config")?;
    config::init_tracing(app_config.log_level(), app_config.log_json);

    let form_type = FormType::from_str(&args.form_type)
        .map_err(|_| anyhow!("unrecognized form type '{}'", args.form_type))?;

    let extractor = Arc::new(JsonFileExtractor {
        path: args.tables.clone(),
    });
    let renderer = Arc::new(JsonDumpRenderer {
        out_dir: args.out_dir.clone(),
    });
    let (state, event_rx) = AppState::new(app_config, extractor, renderer);
    tokio::spawn(events::process_events(event_rx));

    let workflow = state.workflow_service();
    let lot = workflow
        .create_lot(Uuid::new_v4(), args.lot_number.clone(), vec![Uuid::new_v4()])
        .await?;

    // Steps 1→2, criteria, then 2→3 with the extraction sub-job.
    workflow
        .continue_lot(lot.id, ContinueRequest::from_step(1))
        .await?;
    workflow
        .setup_criteria(lot.id, form_type, &args.criterion)
        .await?;
    let outcome = workflow
        .continue_lot(lot.id, ContinueRequest::from_step(2))
        .await?;
    let snapshot = match outcome.job {
        Some(job) => job.join().await?,
        None => outcome.lot,
    };
    if snapshot.status == LotStatus::ExtractionFailed {
        for error in &snapshot.steps.get(WorkflowStep::Extract).errors {
            eprintln!("extraction error [{}]: {}", error.job, error.message);
        }
        bail!("extraction failed for lot {}", snapshot.lot_number);
    }

    // 3→4 runs allocation and evaluation and dispatches report rendering.
    let outcome = workflow
        .continue_lot(lot.id, ContinueRequest::from_step(3))
        .await?;
    let warnings = outcome.warnings;
    let snapshot = match outcome.job {
        Some(job) => job.join().await?,
        None => outcome.lot,
    };
    if snapshot.status == LotStatus::ReportGenerationFailed {
        for error in &snapshot.steps.get(WorkflowStep::GenerateReports).errors {
            eprintln!("report error [{}]: {}", error.job, error.message);
        }
        bail!("report generation failed for lot {}", snapshot.lot_number);
    }

    // 4→5 adopts the rendered reports, then review and export.
    workflow
        .continue_lot(lot.id, ContinueRequest::from_step(4))
        .await?;
    workflow
        .continue_lot(lot.id, ContinueRequest::from_step(5))
        .await?;
    workflow
        .continue_lot(lot.id, ContinueRequest::from_step(6))
        .await?;

    let lot = workflow.get_lot(lot.id).await?;
    let records = state
        .repositories
        .consumption_records
        .find_by_lot(lot.id)
        .await?;
    let results = state.repositories.origin_results.find_by_lot(lot.id).await?;

    if json {
        print_json(&QualifyOutput {
            lot: &lot,
            shortages: &warnings,
            records: &records,
            results: &results,
        })?;
    } else {
        render_lot(&lot);
        render_shortages(&warnings);
        render_records(&records, &state.config.local_currency);
        render_results(&results);
        for report in &lot.generated_reports {
            match &args.out_dir {
                Some(dir) => println!(
                    "Report {} written to {}",
                    report.kind,
                    dir.join(&report.file_name).display()
                ),
                None => println!("Report {} registered as {}", report.kind, report.file_name),
            }
        }
    }

    Ok(())
}

async fn handle_sample(args: SampleArgs) -> Result<()> {
    let tables = sample_tables();
    let body = serde_json::to_string_pretty(&tables)?;
    fs::write(&args.out, body)
        .await
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("Sample tables written to {}", args.out.display());
    println!(
        "Try: origin-cli qualify --tables {} --form-type B --criterion RVC40",
        args.out.display()
    );
    Ok(())
}

#[derive(Serialize)]
struct QualifyOutput<'a> {
    lot: &'a Lot,
    shortages: &'a [StockShortage],
    records: &'a [ConsumptionRecord],
    results: &'a [OriginResult],
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_lot(lot: &Lot) {
    println!(
        "Lot {} • status {} • step {} of 7",
        lot.lot_number,
        lot.status,
        lot.current_step.number()
    );
}

fn render_shortages(shortages: &[StockShortage]) {
    if shortages.is_empty() {
        return;
    }
    println!("Stock shortages ({} buckets allocated nothing):", shortages.len());
    for s in shortages {
        println!(
            "- {} ({}) • required {} {} • available {}",
            s.material_code, s.material_name, s.required, s.unit, s.available
        );
    }
}

fn render_records(records: &[ConsumptionRecord], local_currency: &str) {
    println!("Consumption statement ({} rows):", records.len());
    for r in records {
        println!(
            "- {} • {} {} of {} • invoice {} ({}) • {} {} • {} USD",
            r.sku_code,
            r.quantity,
            r.unit,
            r.material_code,
            r.invoice_ref,
            r.invoice_date,
            r.line_value_local,
            local_currency,
            r.line_value_usd
        );
    }
}

fn render_results(results: &[OriginResult]) {
    println!("Origin assessment:");
    for r in results {
        let verdict = if r.qualified { "QUALIFIED" } else { "NOT QUALIFIED" };
        println!("- {} [{}] {}", r.sku_code, r.criterion.code(), verdict);
        println!("  {}", r.message);
        for line in &r.breakdown {
            println!(
                "    {}. {} • {} {} • {} USD • {}{}",
                line.line_no,
                line.material_code,
                line.quantity,
                line.unit,
                line.value_usd,
                line.origin_country,
                if line.originating { " (originating)" } else { "" }
            );
        }
    }
}

fn sample_tables() -> ExtractedTables {
    let products = vec![
        ProductRow {
            sku_code: "CHAIR-01".to_string(),
            product_name: "Dining chair, oak veneer".to_string(),
            hs_code: "940161".to_string(),
            quantity: dec!(100),
            unit: "PCS".to_string(),
            fob_value_usd: dec!(5000),
        },
        ProductRow {
            sku_code: "TABLE-02".to_string(),
            product_name: "Dining table 1.6m".to_string(),
            hs_code: "940360".to_string(),
            quantity: dec!(50),
            unit: "PCS".to_string(),
            fob_value_usd: dec!(7500),
        },
    ];

    let materials = vec![
        MaterialRow {
            material_code: "MDF-17".to_string(),
            material_name: "Tam MDF 17mm (1220x2440)".to_string(),
            hs_code: "441114".to_string(),
            unit: "M2".to_string(),
            quantity: dec!(400),
            unit_cost_local: dec!(95000),
            exchange_rate: dec!(24500),
            invoice_ref: "INV-001".to_string(),
            invoice_date: date(2024, 1, 15),
            origin_country: "CN".to_string(),
            certificate_ref: None,
        },
        MaterialRow {
            material_code: "MDF-17".to_string(),
            material_name: "Tam MDF 17mm (1220x2440)".to_string(),
            hs_code: "441114".to_string(),
            unit: "M2".to_string(),
            quantity: dec!(300),
            unit_cost_local: dec!(97500),
            exchange_rate: dec!(24650),
            invoice_ref: "INV-014".to_string(),
            invoice_date: date(2024, 2, 20),
            origin_country: "CN".to_string(),
            certificate_ref: None,
        },
        MaterialRow {
            material_code: "FAB-GR".to_string(),
            material_name: "Vai boc ghe mau xam".to_string(),
            hs_code: "540752".to_string(),
            unit: "M".to_string(),
            quantity: dec!(250),
            unit_cost_local: dec!(52000),
            exchange_rate: dec!(24600),
            invoice_ref: "INV-007".to_string(),
            invoice_date: date(2024, 2, 1),
            origin_country: "VN".to_string(),
            certificate_ref: Some("VN-CO-2024-0113".to_string()),
        },
        MaterialRow {
            material_code: "SCREW-4X40".to_string(),
            material_name: "Vit go 4x40".to_string(),
            hs_code: "731814".to_string(),
            unit: "PCS".to_string(),
            quantity: dec!(12000),
            unit_cost_local: dec!(350),
            exchange_rate: dec!(24500),
            invoice_ref: "INV-002".to_string(),
            invoice_date: date(2024, 1, 18),
            origin_country: "CN".to_string(),
            certificate_ref: None,
        },
    ];

    let entries = vec![
        BomRow {
            material_code: "MDF-17".to_string(),
            material_name: "Tam MDF 17mm (1220x2440)".to_string(),
            hs_code: "441114".to_string(),
            unit: "M2".to_string(),
            norm_per_sku: norms(&[("CHAIR-01", dec!(1.2)), ("TABLE-02", dec!(3.4))]),
        },
        BomRow {
            material_code: "FAB-GR".to_string(),
            material_name: "Vai boc ghe mau xam".to_string(),
            hs_code: "540752".to_string(),
            unit: "M".to_string(),
            norm_per_sku: norms(&[("CHAIR-01", dec!(1.8))]),
        },
        BomRow {
            material_code: "SCREW-4X40".to_string(),
            material_name: "Vit go 4x40".to_string(),
            hs_code: "731814".to_string(),
            unit: "PCS".to_string(),
            norm_per_sku: norms(&[("CHAIR-01", dec!(24)), ("TABLE-02", dec!(36))]),
        },
    ];

    ExtractedTables {
        product: ProductTable { products },
        npl: NplTable { materials },
        bom: BomTable {
            sku_list: vec!["CHAIR-01".to_string(), "TABLE-02".to_string()],
            entries,
        },
    }
}

fn norms(pairs: &[(&str, rust_decimal::Decimal)]) -> BTreeMap<String, rust_decimal::Decimal> {
    pairs.iter().map(|(s, n)| (s.to_string(), *n)).collect()
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}
