//! Offline extraction of structural and computational records

pub mod computational;
pub mod cycles;
pub mod formula;
pub mod structural;

pub use computational::extract_measures;
pub use structural::{SheetLayout, extract_structural};

use crate::config::SenseConfig;
use crate::error::{SenseError, SenseResult};
use crate::reader::workbook::{Sheet, Workbook};
use crate::records::{MeasureRecord, StructuralRecord};
use formula::Reference;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Both record sets extracted from one workbook snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub structural: Vec<StructuralRecord>,
    pub measures: Vec<MeasureRecord>,
}

/// Run both extractors over a workbook.
///
/// Defective formulas degrade their own record; only a workbook without any
/// sheet to extract is an error.
pub fn extract(workbook: &Workbook, config: &SenseConfig) -> SenseResult<Extraction> {
    if workbook
        .sheets
        .iter()
        .all(|s| config.is_sheet_skipped(&s.name))
    {
        return Err(SenseError::Extraction(format!(
            "workbook '{}' has no sheets to extract",
            workbook.path.display()
        )));
    }

    let (structural, measures) = rayon::join(
        || extract_structural(workbook, config),
        || extract_measures(workbook, config),
    );
    info!(
        structural = structural.len(),
        measures = measures.len(),
        "extraction finished"
    );
    Ok(Extraction {
        structural,
        measures,
    })
}

/// Sheet a reference points at: its own sheet prefix, or the formula's sheet.
///
/// `None` for external workbooks and sheets missing from the snapshot.
pub(crate) fn target_sheet<'a>(
    workbook: &'a Workbook,
    reference: &Reference,
    current: &str,
) -> Option<&'a Sheet> {
    if reference.external.is_some() {
        return None;
    }
    match &reference.sheet {
        Some(name) => workbook.find_sheet(name),
        None => workbook.get_sheet(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::workbook::CellValue;

    #[test]
    fn test_extract_runs_both_extractors() {
        let mut sheet = Sheet::new("Income");
        sheet.set_value(0, 0, CellValue::Text("Revenue".into()));
        sheet.set_value(0, 1, CellValue::Text("Cost".into()));
        sheet.set_value(0, 2, CellValue::Text("Profit".into()));
        sheet.set_value(1, 0, CellValue::Number(10.0));
        sheet.set_value(1, 1, CellValue::Number(4.0));
        sheet.set_formula(1, 2, "A2-B2", CellValue::Number(6.0));
        let workbook = Workbook::from_sheets(vec![sheet]);

        let extraction = extract(&workbook, &SenseConfig::default()).unwrap();
        assert_eq!(extraction.structural.len(), 3);
        assert_eq!(extraction.measures.len(), 1);
    }

    #[test]
    fn test_empty_workbook_is_an_extraction_error() {
        let workbook = Workbook::from_sheets(Vec::new());
        let err = extract(&workbook, &SenseConfig::default()).unwrap_err();
        assert!(matches!(err, SenseError::Extraction(_)));
    }
}
