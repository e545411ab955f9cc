//! Live spreadsheet reads used for value verification

use crate::error::ServiceError;
use crate::reader::workbook::{CellValue, Workbook};
use crate::reference::CellReference;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A typed value read from the spreadsheet, with its formula if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveValue {
    pub sheet: String,
    pub address: String,
    pub value: CellValue,
    /// Formula text with the leading `=`
    pub formula: Option<String>,
}

/// Read access to the spreadsheet behind an index.
///
/// The data may lag the snapshot the index was built from.
pub trait SpreadsheetSource: Send + Sync {
    /// Point read; `address` is A1 notation
    fn get_cell_value(&self, sheet: &str, address: &str) -> Result<LiveValue, ServiceError>;

    /// Non-empty cells of a 1-based row, left to right
    fn get_row_values(&self, sheet: &str, row: u32) -> Result<Vec<LiveValue>, ServiceError>;
}

/// Serves reads from an in-memory workbook
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    workbook: Arc<Workbook>,
}

impl SnapshotSource {
    pub fn new(workbook: Arc<Workbook>) -> Self {
        Self { workbook }
    }

    fn live(sheet: &str, row: u32, col: u32, value: CellValue, formula: Option<&str>) -> LiveValue {
        LiveValue {
            sheet: sheet.to_string(),
            address: CellReference::new(row, col).to_excel_ref(),
            value,
            formula: formula.map(|f| format!("={}", f)),
        }
    }
}

impl SpreadsheetSource for SnapshotSource {
    fn get_cell_value(&self, sheet: &str, address: &str) -> Result<LiveValue, ServiceError> {
        let data = self
            .workbook
            .find_sheet(sheet)
            .ok_or_else(|| ServiceError::NotFound(format!("sheet '{}'", sheet)))?;
        let cell_ref = CellReference::parse_a1(address)
            .ok_or_else(|| ServiceError::Permanent(format!("invalid cell address '{}'", address)))?;

        Ok(match data.get_cell(cell_ref.row, cell_ref.col) {
            Some(cell) => Self::live(
                &data.name,
                cell.row,
                cell.col,
                cell.value.clone(),
                cell.formula.as_deref(),
            ),
            None => Self::live(&data.name, cell_ref.row, cell_ref.col, CellValue::Empty, None),
        })
    }

    fn get_row_values(&self, sheet: &str, row: u32) -> Result<Vec<LiveValue>, ServiceError> {
        let data = self
            .workbook
            .find_sheet(sheet)
            .ok_or_else(|| ServiceError::NotFound(format!("sheet '{}'", sheet)))?;
        let row = row
            .checked_sub(1)
            .ok_or_else(|| ServiceError::Permanent("rows are numbered from 1".to_string()))?;
        Ok(data
            .row_cells(row)
            .into_iter()
            .map(|cell| {
                Self::live(
                    &data.name,
                    cell.row,
                    cell.col,
                    cell.value.clone(),
                    cell.formula.as_deref(),
                )
            })
            .collect())
    }
}
