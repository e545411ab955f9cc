//! Semantic records produced by extraction and stored in the indices

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Numeric,
    Date,
    Text,
    Boolean,
    Mixed,
    /// Header present, no data below it
    Empty,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Numeric => "numeric",
            DataType::Date => "date",
            DataType::Text => "text",
            DataType::Boolean => "boolean",
            DataType::Mixed => "mixed",
            DataType::Empty => "empty",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic summary of one spreadsheet column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralRecord {
    pub sheet: String,
    /// Header label, or the column letter when the sheet has no header row
    pub column: String,
    pub column_index: u32,
    /// Data range, e.g. `B2:B13`
    pub address: String,
    pub data_type: DataType,
    pub description: Option<String>,
    /// Up to five distinct representative values
    pub samples: Vec<String>,
}

impl StructuralRecord {
    /// Identity key: one record per (sheet, column)
    pub fn key(&self) -> String {
        format!("spec:{}:{}", self.sheet, self.column)
    }

    /// Text embedded for the structural index
    pub fn projection(&self) -> String {
        let mut text = format!(
            "column {} | sheet {} | {} | type {}",
            self.column, self.sheet, self.address, self.data_type
        );
        if let Some(description) = &self.description {
            text.push_str(" | ");
            text.push_str(description);
        }
        if !self.samples.is_empty() {
            text.push_str(" | samples ");
            text.push_str(&self.samples.join(", "));
        }
        text
    }
}

/// Extraction markers attached to a measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureFlag {
    /// Part of a circular reference chain; raw formula kept, no substitution
    Cyclic,
    /// Uses a non-deterministic function (NOW, RAND, ...)
    Volatile,
    /// References an external workbook or a sheet absent from the snapshot
    PartialResolution,
}

impl MeasureFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureFlag::Cyclic => "cyclic",
            MeasureFlag::Volatile => "volatile",
            MeasureFlag::PartialResolution => "partial-resolution",
        }
    }
}

/// A formula pattern repeated uniformly down a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    /// Parameterised pattern, e.g. `=(A{row} - B{row}) / A{row}`
    pub pattern: String,
    /// 1-based first and last spreadsheet rows covered by the rule
    pub first_row: u32,
    pub last_row: u32,
    pub rows: usize,
}

/// Semantic summary of one formula or one repeated formula pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRecord {
    /// Stable identifier derived from sheet and name, unique per spreadsheet
    pub id: String,
    pub name: String,
    pub sheet: String,
    /// Cell address, or the covered range for column rules
    pub address: String,
    pub column_index: u32,
    /// Formula as written, with the leading `=`
    pub raw_formula: String,
    /// Formula with references replaced by identifiers
    pub semantic_formula: String,
    pub column_rule: Option<ColumnRule>,
    /// Identifiers this measure reads from
    pub depends_on: Vec<String>,
    pub flags: Vec<MeasureFlag>,
}

impl MeasureRecord {
    pub fn key(&self) -> String {
        self.id.clone()
    }

    pub fn has_flag(&self, flag: MeasureFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Text embedded for the computational index
    pub fn projection(&self) -> String {
        format!(
            "{} | sheet {} | {} = {}",
            self.name,
            self.sheet,
            slug(&self.name),
            self.semantic_formula
        )
    }
}

/// Which of the two indices a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Structural,
    Computational,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Structural => "structural",
            IndexKind::Computational => "computational",
        }
    }
}

/// A record stored in either index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexedRecord {
    Structural(StructuralRecord),
    Measure(MeasureRecord),
}

impl IndexedRecord {
    pub fn key(&self) -> String {
        match self {
            IndexedRecord::Structural(r) => r.key(),
            IndexedRecord::Measure(r) => r.key(),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            IndexedRecord::Structural(_) => IndexKind::Structural,
            IndexedRecord::Measure(_) => IndexKind::Computational,
        }
    }

    pub fn projection(&self) -> String {
        match self {
            IndexedRecord::Structural(r) => r.projection(),
            IndexedRecord::Measure(r) => r.projection(),
        }
    }

    pub fn sheet(&self) -> &str {
        match self {
            IndexedRecord::Structural(r) => &r.sheet,
            IndexedRecord::Measure(r) => &r.sheet,
        }
    }

    /// Column header or measure name
    pub fn label(&self) -> &str {
        match self {
            IndexedRecord::Structural(r) => &r.column,
            IndexedRecord::Measure(r) => &r.name,
        }
    }

    /// Identifier other measures use for this record in `depends_on`
    pub fn lineage_id(&self) -> String {
        match self {
            IndexedRecord::Structural(r) => format!("{}.{}", slug(&r.sheet), slug(&r.column)),
            IndexedRecord::Measure(r) => r.id.clone(),
        }
    }

    /// Whether either record reads from the other
    pub fn is_linked_to(&self, other: &IndexedRecord) -> bool {
        let reads = |a: &IndexedRecord, b: &IndexedRecord| {
            a.as_measure()
                .is_some_and(|m| m.depends_on.contains(&b.lineage_id()))
        };
        reads(self, other) || reads(other, self)
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            IndexedRecord::Structural(r) => Provenance {
                sheet: r.sheet.clone(),
                address: r.address.clone(),
                formula: None,
            },
            IndexedRecord::Measure(r) => Provenance {
                sheet: r.sheet.clone(),
                address: r.address.clone(),
                formula: Some(r.raw_formula.clone()),
            },
        }
    }

    pub fn as_structural(&self) -> Option<&StructuralRecord> {
        match self {
            IndexedRecord::Structural(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_measure(&self) -> Option<&MeasureRecord> {
        match self {
            IndexedRecord::Measure(r) => Some(r),
            _ => None,
        }
    }
}

/// Where an answer comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub sheet: String,
    pub address: String,
    pub formula: Option<String>,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.address)?;
        if let Some(formula) = &self.formula {
            write!(f, " ({})", formula)?;
        }
        Ok(())
    }
}

/// One nearest-neighbour hit; transient, never persisted
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub record: Arc<IndexedRecord>,
    pub score: f32,
    /// 1-based rank within the query
    pub rank: usize,
}

/// Lowercase snake_case identifier: "Cost of Goods" -> `cost_of_goods`, "GrossMargin" -> `gross_margin`
pub fn slug(text: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Cost of Goods"), "cost_of_goods");
        assert_eq!(slug("GrossMargin"), "gross_margin");
        assert_eq!(slug("  Net  Income (USD) "), "net_income_usd");
        assert_eq!(slug("EBITDA"), "ebitda");
        assert_eq!(slug("%"), "unnamed");
    }

    #[test]
    fn test_projection_contents() {
        let record = StructuralRecord {
            sheet: "Sales".into(),
            column: "Revenue".into(),
            column_index: 1,
            address: "B2:B13".into(),
            data_type: DataType::Numeric,
            description: Some("Monthly revenue".into()),
            samples: vec!["100".into(), "120".into()],
        };
        let text = record.projection();
        assert!(text.contains("column Revenue"));
        assert!(text.contains("sheet Sales"));
        assert!(text.contains("Monthly revenue"));
        assert!(text.contains("100, 120"));
        assert_eq!(record.key(), "spec:Sales:Revenue");
    }

    #[test]
    fn test_provenance_display() {
        let p = Provenance {
            sheet: "Income".into(),
            address: "C2:C4".into(),
            formula: Some("=(A2-B2)/A2".into()),
        };
        assert_eq!(p.to_string(), "Income!C2:C4 (=(A2-B2)/A2)");
    }
}
