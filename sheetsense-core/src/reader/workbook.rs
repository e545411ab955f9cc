//! Workbook snapshot data structures

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// A read-only snapshot of a complete workbook
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    pub path: PathBuf,
    pub sheets: Vec<Sheet>,
    /// Labelled ranges: name -> reference text (e.g. `Assumptions!$B$2`)
    pub defined_names: HashMap<String, String>,
}

impl Workbook {
    /// Build a workbook from in-memory sheets
    pub fn from_sheets(sheets: Vec<Sheet>) -> Self {
        Self {
            path: PathBuf::new(),
            sheets,
            defined_names: HashMap::new(),
        }
    }

    /// Get a sheet by name
    pub fn get_sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    /// Get a sheet by name, ignoring ASCII case (formulas are not case-sensitive on sheet names)
    pub fn find_sheet(&self, name: &str) -> Option<&Sheet> {
        self.get_sheet(name)
            .or_else(|| self.sheets.iter().find(|s| s.name.eq_ignore_ascii_case(name)))
    }

    /// Get all sheet names
    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Content fingerprint of the snapshot, stable across loads of the same data.
    ///
    /// Used as the spreadsheet version identifier when indexing.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for sheet in &self.sheets {
            hasher.update(sheet.name.as_bytes());
            hasher.update([0u8]);
            for cell in sheet.sorted_cells() {
                hasher.update(cell.row.to_le_bytes());
                hasher.update(cell.col.to_le_bytes());
                hasher.update(cell.value.to_string().as_bytes());
                if let Some(formula) = &cell.formula {
                    hasher.update(b"=");
                    hasher.update(formula.as_bytes());
                }
                hasher.update([0u8]);
            }
        }
        let names: BTreeMap<_, _> = self.defined_names.iter().collect();
        for (name, target) in names {
            hasher.update(name.as_bytes());
            hasher.update(target.as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

/// Represents a worksheet
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub cells: HashMap<(u32, u32), Cell>,
    /// Error message if the formulas of this sheet could not be decoded
    pub formula_error: Option<String>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: HashMap::new(),
            formula_error: None,
        }
    }

    /// Insert a plain value cell
    pub fn set_value(&mut self, row: u32, col: u32, value: CellValue) {
        self.cells.insert(
            (row, col),
            Cell {
                row,
                col,
                value,
                formula: None,
            },
        );
    }

    /// Insert a formula cell with its cached value
    pub fn set_formula(&mut self, row: u32, col: u32, formula: impl Into<String>, cached: CellValue) {
        self.cells.insert(
            (row, col),
            Cell {
                row,
                col,
                value: cached,
                formula: Some(formula.into()),
            },
        );
    }

    /// Get a cell at the given position
    pub fn get_cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    /// Get all cells with values
    pub fn all_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// All cells ordered by (row, col)
    pub fn sorted_cells(&self) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self.cells.values().collect();
        cells.sort_by_key(|c| (c.row, c.col));
        cells
    }

    /// Get non-empty cells in a specific row, ordered by column
    pub fn row_cells(&self, row: u32) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self
            .cells
            .values()
            .filter(|c| c.row == row && !c.is_blank())
            .collect();
        cells.sort_by_key(|c| c.col);
        cells
    }

    /// Get non-empty cells in a specific column, ordered by row
    pub fn column_cells(&self, col: u32) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self
            .cells
            .values()
            .filter(|c| c.col == col && !c.is_blank())
            .collect();
        cells.sort_by_key(|c| c.row);
        cells
    }

    /// Columns that hold at least one non-empty cell, ascending
    pub fn occupied_columns(&self) -> Vec<u32> {
        let mut cols: Vec<u32> = self
            .cells
            .values()
            .filter(|c| !c.is_blank())
            .map(|c| c.col)
            .collect();
        cols.sort_unstable();
        cols.dedup();
        cols
    }

    /// First row holding a non-empty cell
    pub fn first_data_row(&self) -> Option<u32> {
        self.cells
            .values()
            .filter(|c| !c.is_blank())
            .map(|c| c.row)
            .min()
    }

    /// Cells carrying a formula
    pub fn formula_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values().filter(|c| c.formula.is_some())
    }
}

/// Represents a single cell
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
    /// Literal value, or the cached result for formula cells
    pub value: CellValue,
    /// Formula text without the leading `=`
    pub formula: Option<String>,
}

impl Cell {
    /// Neither a value nor a formula
    pub fn is_blank(&self) -> bool {
        self.value.is_empty() && self.formula.is_none()
    }

    /// Text cell that is not a formula result
    pub fn is_label(&self) -> bool {
        self.formula.is_none() && matches!(self.value, CellValue::Text(ref t) if !t.trim().is_empty())
    }
}

/// Cell value types
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    /// Serial date as stored by the spreadsheet
    Date(f64),
    Text(String),
    Boolean(bool),
    Error(String),
}

impl CellValue {
    /// Check if the cell contains an error
    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Check if the cell is empty
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(t) => t.is_empty(),
            _ => false,
        }
    }

    /// Text that does not parse as a number
    pub fn is_non_numeric_text(&self) -> bool {
        match self {
            CellValue::Text(t) => t.trim().parse::<f64>().is_err(),
            _ => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(n) | CellValue::Date(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            CellValue::Text(t) => write!(f, "{}", t),
            CellValue::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Error(e) => write!(f, "{}", e),
        }
    }
}
