//! Output formatters for records and answers

use anyhow::Result;
use colored::*;
use serde::Serialize;
use sheetsense_core::{
    Extraction, IndexSnapshot, IndexedRecord, MeasureRecord, Outcome, QueryResponse, RankedResult,
    StructuralRecord,
};
use std::collections::BTreeMap;
use std::path::Path;

/// Print extracted records grouped by sheet
pub fn print_extraction(file_path: &Path, extraction: &Extraction) {
    println!("{}", format!("Records: {}", file_path.display()).bold());
    println!();

    let mut columns: BTreeMap<&str, Vec<&StructuralRecord>> = BTreeMap::new();
    for record in &extraction.structural {
        columns.entry(record.sheet.as_str()).or_default().push(record);
    }
    let mut measures: BTreeMap<&str, Vec<&MeasureRecord>> = BTreeMap::new();
    for record in &extraction.measures {
        measures.entry(record.sheet.as_str()).or_default().push(record);
    }

    let mut sheets: Vec<&str> = columns.keys().chain(measures.keys()).copied().collect();
    sheets.sort_unstable();
    sheets.dedup();

    for sheet in sheets {
        println!("{} {}", "Sheet:".bold(), sheet.cyan().bold());
        for column in columns.get(sheet).into_iter().flatten() {
            println!(
                "  {} {} {} [{}]",
                "COL".blue().bold(),
                column.column,
                column.address.yellow(),
                column.data_type.to_string().bright_black()
            );
        }
        for measure in measures.get(sheet).into_iter().flatten() {
            print_measure(measure, 1);
        }
        println!();
    }

    println!("{}", "Summary:".bold().underline());
    println!("  {} {}", "Columns:".bold(), extraction.structural.len());
    println!("  {} {}", "Measures:".bold(), extraction.measures.len());
}

fn print_measure(measure: &MeasureRecord, indent: usize) {
    let indent_str = "  ".repeat(indent);
    println!(
        "{}{} {} {} = {}",
        indent_str,
        "FX".magenta().bold(),
        measure.name,
        measure.address.yellow(),
        measure.semantic_formula
    );
    if !measure.flags.is_empty() {
        let flags: Vec<&str> = measure.flags.iter().map(|f| f.as_str()).collect();
        println!("{}  {}", indent_str, flags.join(", ").red());
    }
}

pub fn print_index_summary(file_path: &Path, out: &Path, snapshot: &IndexSnapshot) {
    println!("{}", format!("Indexed: {}", file_path.display()).bold());
    println!("  {} {}", "Spreadsheet id:".bold(), snapshot.spreadsheet_id);
    println!("  {} {}", "Columns:".bold(), snapshot.structural.len());
    println!("  {} {}", "Measures:".bold(), snapshot.computational.len());
    println!("{}", format!("✓ Index written to {}", out.display()).green().bold());
}

/// Print an answer, a clarification or a low-confidence result
pub fn print_response(response: &QueryResponse) {
    match &response.outcome {
        Outcome::Clarification { question } => {
            println!("{} {}", "?".yellow().bold(), question);
        }
        Outcome::Answer { results } => {
            print_results(results);
        }
        Outcome::LowConfidence { results } => {
            println!(
                "{}",
                "Low confidence: no result reached the similarity threshold."
                    .yellow()
                    .bold()
            );
            print_results(results);
        }
    }
}

fn print_results(results: &[RankedResult]) {
    if results.is_empty() {
        println!("{}", "No matching records.".bright_black());
        return;
    }
    for result in results {
        let label = match &result.record {
            IndexedRecord::Structural(r) => format!("column {}", r.column),
            IndexedRecord::Measure(r) => r.name.clone(),
        };
        println!(
            "{} {} {} {}",
            format!("{}.", result.rank).bold(),
            label.cyan().bold(),
            result.provenance.to_string().yellow(),
            format!("({:.2})", result.score).bright_black()
        );
        if let Some(value) = &result.verified_value {
            println!("   {} {} = {}", "Live:".green().bold(), value.address, value.value);
        }
        println!("   {}", result.rationale);
    }
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
