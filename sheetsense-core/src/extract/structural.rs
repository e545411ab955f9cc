//! Structural extraction: one record per occupied column

use crate::config::SenseConfig;
use crate::reader::workbook::{Cell, CellValue, Sheet, Workbook};
use crate::records::{DataType, StructuralRecord};
use crate::reference::{CellReference, col_to_letter, format_range};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Header detection result for one sheet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetLayout {
    /// 0-based header row, `None` when every row is data
    pub header_row: Option<u32>,
    /// Unique column labels keyed by column index
    pub labels: BTreeMap<u32, String>,
}

impl SheetLayout {
    /// Detect the header row of a sheet and label its occupied columns.
    ///
    /// `forced_header` is a 1-based row taken from configuration.
    pub fn detect(sheet: &Sheet, forced_header: Option<u32>) -> Self {
        let header_row = match forced_header {
            Some(row) if row > 0 => Some(row - 1),
            _ => detect_header_row(sheet),
        };

        let mut labels = BTreeMap::new();
        let mut seen = HashSet::new();
        for col in sheet.occupied_columns() {
            let header_text = header_row
                .and_then(|row| sheet.get_cell(row, col))
                .map(|cell| cell.value.to_string().trim().to_string())
                .filter(|text| !text.is_empty());
            let mut label = header_text.unwrap_or_else(|| col_to_letter(col));
            if !seen.insert(label.to_lowercase()) {
                label = format!("{} ({})", label, col_to_letter(col));
                seen.insert(label.to_lowercase());
            }
            labels.insert(col, label);
        }

        Self { header_row, labels }
    }

    pub fn has_header(&self) -> bool {
        self.header_row.is_some()
    }

    /// Header label of a column, only when the sheet has a real header row
    pub fn header_label(&self, col: u32) -> Option<&str> {
        self.header_row?;
        self.labels.get(&col).map(|s| s.as_str())
    }

    /// Whether `row` lies below the header (every row when there is none)
    pub fn is_data_row(&self, row: u32) -> bool {
        self.header_row.is_none_or(|h| row > h)
    }
}

/// First non-empty row is a header when most of its cells are non-numeric text
/// and the next non-empty row holds mostly typed values.
fn detect_header_row(sheet: &Sheet) -> Option<u32> {
    let first = sheet.first_data_row()?;
    let header_cells = sheet.row_cells(first);
    let text_count = header_cells
        .iter()
        .filter(|c| c.formula.is_none() && c.value.is_non_numeric_text())
        .count();
    if text_count * 2 <= header_cells.len() {
        return None;
    }

    let next = sheet
        .all_cells()
        .filter(|c| c.row > first && !c.is_blank())
        .map(|c| c.row)
        .min()?;
    let next_cells = sheet.row_cells(next);
    let typed = next_cells
        .iter()
        .filter(|c| c.formula.is_some() || !c.value.is_non_numeric_text())
        .count();
    let all_text_header = text_count == header_cells.len();

    if typed * 2 >= next_cells.len() || (all_text_header && typed > 0) {
        Some(first)
    } else {
        None
    }
}

/// Classify a single value; `None` for blanks and error values
fn classify(value: &CellValue) -> Option<DataType> {
    match value {
        CellValue::Empty | CellValue::Error(_) => None,
        CellValue::Number(_) => Some(DataType::Numeric),
        CellValue::Date(_) => Some(DataType::Date),
        CellValue::Boolean(_) => Some(DataType::Boolean),
        CellValue::Text(t) if t.trim().is_empty() => None,
        CellValue::Text(t) if t.trim().parse::<f64>().is_ok() => Some(DataType::Numeric),
        CellValue::Text(_) => Some(DataType::Text),
    }
}

/// Majority type; a type needs a strict majority of classified cells, otherwise `Mixed`
fn infer_type(cells: &[&Cell], limit: usize) -> DataType {
    let mut counts: BTreeMap<&'static str, (DataType, usize)> = BTreeMap::new();
    let mut total = 0usize;
    for cell in cells.iter().take(limit) {
        if let Some(data_type) = classify(&cell.value) {
            counts.entry(data_type.as_str()).or_insert((data_type, 0)).1 += 1;
            total += 1;
        }
    }
    if total == 0 {
        return DataType::Empty;
    }
    counts
        .values()
        .find(|(_, count)| count * 2 > total)
        .map(|(data_type, _)| *data_type)
        .unwrap_or(DataType::Mixed)
}

/// Up to `limit` distinct display values, in row order
fn samples(cells: &[&Cell], limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cell in cells {
        if out.len() >= limit {
            break;
        }
        let text = cell.value.to_string();
        let text = text.trim();
        if text.is_empty() || cell.value.is_error() {
            continue;
        }
        if seen.insert(text.to_string()) {
            out.push(text.to_string());
        }
    }
    out
}

/// Extract the structural records of one sheet
pub fn extract_sheet(sheet: &Sheet, config: &SenseConfig) -> Vec<StructuralRecord> {
    let forced = config.sheet(&sheet.name).and_then(|s| s.header_row);
    let layout = SheetLayout::detect(sheet, forced);
    let ex = &config.extraction;

    let records: Vec<StructuralRecord> = layout
        .labels
        .iter()
        .map(|(&col, label)| {
            let data: Vec<&Cell> = sheet
                .column_cells(col)
                .into_iter()
                .filter(|c| layout.is_data_row(c.row))
                .collect();

            let address = match (data.first(), data.last()) {
                (Some(first), Some(last)) => format_range(
                    CellReference::new(first.row, col),
                    CellReference::new(last.row, col),
                ),
                _ => {
                    let row = layout
                        .header_row
                        .or_else(|| sheet.column_cells(col).first().map(|c| c.row))
                        .unwrap_or(0);
                    CellReference::new(row, col).to_excel_ref()
                }
            };

            let formula_count = data.iter().filter(|c| c.formula.is_some()).count();
            let description = config
                .column_description(&sheet.name, label)
                .map(|d| d.to_string())
                .or_else(|| {
                    (!data.is_empty() && formula_count * 2 > data.len())
                        .then(|| "Computed by formula".to_string())
                });

            StructuralRecord {
                sheet: sheet.name.clone(),
                column: label.clone(),
                column_index: col,
                address,
                data_type: infer_type(&data, ex.type_sample_limit),
                description,
                samples: samples(&data, ex.sample_size.min(5)),
            }
        })
        .collect();

    debug!(
        sheet = %sheet.name,
        header = ?layout.header_row.map(|r| r + 1),
        columns = records.len(),
        "structural extraction"
    );
    records
}

/// Extract structural records for every sheet that is not skipped.
///
/// Sheets are processed in parallel; output keeps workbook sheet order.
pub fn extract_structural(workbook: &Workbook, config: &SenseConfig) -> Vec<StructuralRecord> {
    workbook
        .sheets
        .par_iter()
        .filter(|sheet| !config.is_sheet_skipped(&sheet.name))
        .map(|sheet| extract_sheet(sheet, config))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales_sheet() -> Sheet {
        let mut sheet = Sheet::new("Sales");
        for (col, header) in ["Month", "Revenue", "Cost of Goods", "Active"].iter().enumerate() {
            sheet.set_value(0, col as u32, CellValue::Text(header.to_string()));
        }
        let rows = [("Jan", 100.0, 60.0, true), ("Feb", 120.0, 70.0, false), ("Mar", 100.0, 65.0, true)];
        for (i, (month, revenue, cost, active)) in rows.iter().enumerate() {
            let row = i as u32 + 1;
            sheet.set_value(row, 0, CellValue::Text(month.to_string()));
            sheet.set_value(row, 1, CellValue::Number(*revenue));
            sheet.set_value(row, 2, CellValue::Number(*cost));
            sheet.set_value(row, 3, CellValue::Boolean(*active));
        }
        sheet
    }

    #[test]
    fn test_header_detection_and_types() {
        let workbook = Workbook::from_sheets(vec![sales_sheet()]);
        let records = extract_structural(&workbook, &SenseConfig::default());

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].column, "Month");
        assert_eq!(records[0].data_type, DataType::Text);
        assert_eq!(records[1].column, "Revenue");
        assert_eq!(records[1].data_type, DataType::Numeric);
        assert_eq!(records[1].address, "B2:B4");
        // Repeated values are sampled once
        assert_eq!(records[1].samples, vec!["100", "120"]);
        assert_eq!(records[3].data_type, DataType::Boolean);
    }

    #[test]
    fn test_no_header_uses_column_letters() {
        let mut sheet = Sheet::new("Raw");
        for row in 0..3 {
            sheet.set_value(row, 0, CellValue::Number(row as f64));
            sheet.set_value(row, 2, CellValue::Number(row as f64 * 2.0));
        }
        let workbook = Workbook::from_sheets(vec![sheet]);
        let records = extract_structural(&workbook, &SenseConfig::default());

        let labels: Vec<_> = records.iter().map(|r| r.column.as_str()).collect();
        assert_eq!(labels, vec!["A", "C"]);
        assert_eq!(records[0].address, "A1:A3");
    }

    #[test]
    fn test_header_only_column_is_empty_not_dropped() {
        let mut sheet = sales_sheet();
        sheet.set_value(0, 4, CellValue::Text("Notes".into()));
        let workbook = Workbook::from_sheets(vec![sheet]);
        let records = extract_structural(&workbook, &SenseConfig::default());

        let notes = records.iter().find(|r| r.column == "Notes").unwrap();
        assert_eq!(notes.data_type, DataType::Empty);
        assert_eq!(notes.address, "E1");
        assert!(notes.samples.is_empty());
    }

    #[test]
    fn test_mixed_type_without_majority() {
        let mut sheet = Sheet::new("Odd");
        sheet.set_value(0, 0, CellValue::Text("Value".into()));
        sheet.set_value(0, 1, CellValue::Text("Other".into()));
        sheet.set_value(1, 0, CellValue::Number(1.0));
        sheet.set_value(1, 1, CellValue::Number(1.0));
        sheet.set_value(2, 0, CellValue::Text("one".into()));
        sheet.set_value(3, 0, CellValue::Boolean(true));
        let workbook = Workbook::from_sheets(vec![sheet]);
        let records = extract_structural(&workbook, &SenseConfig::default());
        assert_eq!(records[0].data_type, DataType::Mixed);
    }

    #[test]
    fn test_duplicate_headers_stay_distinct() {
        let mut sheet = Sheet::new("Dup");
        sheet.set_value(0, 0, CellValue::Text("Amount".into()));
        sheet.set_value(0, 1, CellValue::Text("Amount".into()));
        sheet.set_value(1, 0, CellValue::Number(1.0));
        sheet.set_value(1, 1, CellValue::Number(2.0));
        let layout = SheetLayout::detect(&sheet, None);
        assert_eq!(layout.labels[&0], "Amount");
        assert_eq!(layout.labels[&1], "Amount (B)");
    }

    #[test]
    fn test_config_overrides() {
        let mut config = SenseConfig::default();
        let mut sheet_config = crate::config::SheetConfig::default();
        sheet_config
            .descriptions
            .insert("Revenue".into(), "Net sales".into());
        config.sheets.insert("Sales".into(), sheet_config);
        config.sheets.insert(
            "Scratch".into(),
            crate::config::SheetConfig {
                skip: true,
                ..Default::default()
            },
        );

        let mut scratch = Sheet::new("Scratch");
        scratch.set_value(0, 0, CellValue::Number(1.0));
        let workbook = Workbook::from_sheets(vec![sales_sheet(), scratch]);
        let records = extract_structural(&workbook, &config);

        assert!(records.iter().all(|r| r.sheet == "Sales"));
        let revenue = records.iter().find(|r| r.column == "Revenue").unwrap();
        assert_eq!(revenue.description.as_deref(), Some("Net sales"));
    }

    #[test]
    fn test_forced_header_row() {
        let mut sheet = Sheet::new("Report");
        sheet.set_value(0, 0, CellValue::Text("Quarterly report".into()));
        sheet.set_value(1, 0, CellValue::Text("Region".into()));
        sheet.set_value(1, 1, CellValue::Text("Total".into()));
        sheet.set_value(2, 0, CellValue::Text("North".into()));
        sheet.set_value(2, 1, CellValue::Number(5.0));

        let layout = SheetLayout::detect(&sheet, Some(2));
        assert_eq!(layout.header_row, Some(1));
        assert_eq!(layout.header_label(1), Some("Total"));
        assert!(!layout.is_data_row(1));
    }
}
