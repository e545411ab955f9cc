//! Excel/ODS snapshot reader using calamine

use anyhow::{Context, Result};
use calamine::{Data, Range, Reader, Sheets, open_workbook_auto};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

pub mod workbook;

pub use workbook::{Cell, CellValue, Sheet, Workbook};

/// Read a workbook snapshot (values, formulas and labelled ranges) from a file path
pub fn read_workbook<P: AsRef<Path>>(path: P) -> Result<Workbook> {
    let path = path.as_ref();
    let mut excel: Sheets<_> = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook: {}", path.display()))?;

    let defined_names: HashMap<String, String> = excel
        .defined_names()
        .iter()
        .map(|(name, target)| (name.clone(), target.clone()))
        .collect();

    let mut sheets = Vec::new();
    for sheet_name in excel.sheet_names() {
        let range = excel
            .worksheet_range(&sheet_name)
            .with_context(|| format!("Failed to read sheet '{}'", sheet_name))?;

        // Formulas are best effort: a sheet we cannot decode still contributes its values
        let (formula_range, formula_error) = match excel.worksheet_formula(&sheet_name) {
            Ok(range) => (Some(range), None),
            Err(e) => {
                warn!(sheet = %sheet_name, error = %e, "formulas unavailable, keeping values only");
                (None, Some(e.to_string()))
            }
        };

        let sheet = parse_sheet(&sheet_name, &range, formula_range.as_ref(), formula_error);
        debug!(sheet = %sheet.name, cells = sheet.cells.len(), "sheet loaded");
        sheets.push(sheet);
    }

    Ok(Workbook {
        path: path.to_path_buf(),
        sheets,
        defined_names,
    })
}

fn parse_sheet(
    name: &str,
    range: &Range<Data>,
    formula_range: Option<&Range<String>>,
    formula_error: Option<String>,
) -> Sheet {
    let mut sheet = Sheet::new(name);
    sheet.formula_error = formula_error;

    if let Some((start_row, start_col)) = range.start() {
        for (rel_row, rel_col, data) in range.used_cells() {
            let value = parse_cell_value(data);
            if value.is_empty() {
                continue;
            }
            let row = start_row + rel_row as u32;
            let col = start_col + rel_col as u32;
            sheet.set_value(row, col, value);
        }
    }

    if let Some(formulas) = formula_range {
        if let Some((start_row, start_col)) = formulas.start() {
            for (rel_row, rel_col, formula) in formulas.used_cells() {
                let text = formula.trim().trim_start_matches('=');
                if text.is_empty() {
                    continue;
                }
                let row = start_row + rel_row as u32;
                let col = start_col + rel_col as u32;
                let cached = sheet
                    .get_cell(row, col)
                    .map(|c| c.value.clone())
                    .unwrap_or_default();
                sheet.set_formula(row, col, text, cached);
            }
        }
    }

    sheet
}

fn parse_cell_value(data: &Data) -> CellValue {
    match data {
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Bool(b) => CellValue::Boolean(*b),
        Data::Error(e) => CellValue::Error(e.to_string()),
        Data::Empty => CellValue::Empty,
        Data::DateTime(dt) => CellValue::Date(dt.as_f64()),
        Data::DateTimeIso(s) => CellValue::Text(s.clone()),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
    }
}
