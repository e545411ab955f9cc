//! Computational extraction: measure records with label-substituted formulas

use super::cycles::{Node, cyclic_nodes, dependency_graph};
use super::formula::{
    Reference, Token, function_names, references, relative_signature, render_with, row_pattern,
    tokenize,
};
use super::structural::SheetLayout;
use super::target_sheet;
use crate::config::SenseConfig;
use crate::reader::workbook::{CellValue, Sheet, Workbook};
use crate::records::{ColumnRule, MeasureFlag, MeasureRecord, slug};
use crate::reference::{CellReference, format_range};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// A formula cell with its tokens
struct ParsedCell<'a> {
    sheet: &'a str,
    row: u32,
    col: u32,
    formula: &'a str,
    tokens: Vec<Token>,
}

/// One future measure record: a single cell or a run of same-pattern rows
struct Group<'a> {
    cells: Vec<&'a ParsedCell<'a>>,
    rule: bool,
    cyclic: bool,
}

impl Group<'_> {
    fn first(&self) -> &ParsedCell<'_> {
        self.cells[0]
    }

    fn address(&self) -> String {
        let first = self.first();
        let start = CellReference::new(first.row, first.col);
        if self.rule {
            let last = self.cells[self.cells.len() - 1];
            format_range(start, CellReference::new(last.row, last.col))
        } else {
            start.to_excel_ref()
        }
    }
}

/// Reference text chosen for the semantic formula, plus the records it points at
struct Resolved {
    text: String,
    lineage: Vec<String>,
}

struct Resolver<'a> {
    workbook: &'a Workbook,
    layouts: &'a HashMap<&'a str, SheetLayout>,
    /// (sheet, bounds) of each labelled range, with its identifier
    names: Vec<(String, (u32, u32, Option<u32>, Option<u32>), String)>,
    /// Formula cell -> owning measure id
    measure_ids: HashMap<Node, String>,
}

impl<'a> Resolver<'a> {
    fn new(workbook: &'a Workbook, layouts: &'a HashMap<&'a str, SheetLayout>) -> Self {
        let mut names: Vec<_> = workbook
            .defined_names
            .iter()
            .filter_map(|(name, target)| {
                let tokens = tokenize(target);
                let reference = references(&tokens).next()?;
                let sheet = target_sheet(workbook, reference, "")?;
                Some((sheet.name.clone(), reference.bounds(), slug(name)))
            })
            .collect();
        names.sort();
        Self {
            workbook,
            layouts,
            names,
            measure_ids: HashMap::new(),
        }
    }

    fn defined_name(&self, sheet: &str, reference: &Reference) -> Option<&str> {
        let bounds = reference.bounds();
        self.names
            .iter()
            .find(|(s, b, _)| s == sheet && *b == bounds)
            .map(|(_, _, name)| name.as_str())
    }

    fn resolve(&self, reference: &Reference, cell: &ParsedCell<'_>) -> Resolved {
        let unresolved = || Resolved {
            text: reference.text.clone(),
            lineage: Vec::new(),
        };
        let Some(target) = target_sheet(self.workbook, reference, cell.sheet) else {
            return unresolved();
        };

        if let Some(name) = self.defined_name(&target.name, reference) {
            return Resolved {
                text: name.to_string(),
                lineage: vec![name.to_string()],
            };
        }

        let Some(layout) = self.layouts.get(target.name.as_str()) else {
            return unresolved();
        };
        let sheet_slug = slug(&target.name);
        let local = match reference.single_cell() {
            Some((row, col)) => self.resolve_cell(target, layout, row, col, cell),
            None => self.resolve_range(target, layout, reference),
        };

        match local {
            Some((ident, records)) => {
                let text = if target.name == cell.sheet {
                    ident
                } else {
                    format!("{}.{}", sheet_slug, ident)
                };
                Resolved {
                    text,
                    lineage: records
                        .into_iter()
                        .map(|local| format!("{}.{}", sheet_slug, local))
                        .collect(),
                }
            }
            None => unresolved(),
        }
    }

    /// Local id of the measure a formula cell belongs to
    fn measure_local(&self, target: &Sheet, row: u32, col: u32) -> Option<String> {
        let id = self.measure_ids.get(&(target.name.clone(), row, col))?;
        Some(id.split_once('.').map(|(_, l)| l).unwrap_or(id).to_string())
    }

    /// Local id of the record holding a cell: its measure, else its column
    fn cell_record(&self, target: &Sheet, layout: &SheetLayout, row: u32, col: u32) -> Option<String> {
        self.measure_local(target, row, col)
            .or_else(|| layout.labels.get(&col).map(|label| slug(label)))
    }

    /// (identifier, local ids of the records it reads)
    ///
    /// Cells in other rows of the formula's own sheet take their row label,
    /// unless the labels form a series such as months; the column header
    /// names everything else.
    fn resolve_cell(
        &self,
        target: &Sheet,
        layout: &SheetLayout,
        row: u32,
        col: u32,
        cell: &ParsedCell<'_>,
    ) -> Option<(String, Vec<String>)> {
        let keyed = row_label(target, row, col).filter(|(label_col, _)| {
            target.name == cell.sheet && row != cell.row && !is_label_series(target, layout, *label_col)
        });

        if keyed.is_none() {
            if let (Some(label), Some(header)) = (layout.header_label(col), layout.header_row) {
                if row > header {
                    let base = slug(label);
                    let ident = if row == cell.row {
                        base.clone()
                    } else {
                        format!("{}_{}", base, row - header)
                    };
                    let records = vec![self.measure_local(target, row, col).unwrap_or(base)];
                    return Some((ident, records));
                }
            }
        }

        if let Some((label_col, label)) = keyed.or_else(|| row_label(target, row, col)) {
            let base = slug(label);
            let ident = if col == cell.col {
                base
            } else {
                format!("{}_{}", base, col - label_col)
            };
            let records = self.cell_record(target, layout, row, col).into_iter().collect();
            return Some((ident, records));
        }

        let local = self.measure_local(target, row, col)?;
        Some((local.clone(), vec![local]))
    }

    /// Ranges inside one header column, or along one labelled row, collapse to that label
    fn resolve_range(
        &self,
        target: &Sheet,
        layout: &SheetLayout,
        reference: &Reference,
    ) -> Option<(String, Vec<String>)> {
        let (c1, c2, r1, r2) = reference.bounds();
        if c1 == c2 {
            if let (Some(label), Some(header)) = (layout.header_label(c1), layout.header_row) {
                let below_header = match (r1, r2) {
                    (Some(r1), Some(_)) => r1 > header,
                    _ => true,
                };
                if below_header {
                    let base = slug(label);
                    return Some((base.clone(), vec![base]));
                }
            }
        }
        if let (Some(r1), Some(r2)) = (r1, r2) {
            if r1 == r2 {
                if let Some((_, label)) = row_label(target, r1, c1) {
                    let mut records: Vec<String> = target
                        .row_cells(r1)
                        .into_iter()
                        .filter(|c| (c1..=c2).contains(&c.col) && !c.is_blank())
                        .filter_map(|c| self.cell_record(target, layout, c.row, c.col))
                        .collect();
                    records.dedup();
                    return Some((slug(label), records));
                }
            }
        }
        None
    }
}

/// Leftmost text label in `row`, strictly left of `before_col`
fn row_label(sheet: &Sheet, row: u32, before_col: u32) -> Option<(u32, &str)> {
    sheet
        .row_cells(row)
        .into_iter()
        .filter(|c| c.col < before_col && c.is_label())
        .find_map(|c| match &c.value {
            CellValue::Text(t) => Some((c.col, t.trim())),
            _ => None,
        })
}

/// Shape of a label: letters become `a`, digits `9`, everything else stays
fn label_shape(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                '9'
            } else if c.is_alphabetic() {
                'a'
            } else {
                c
            }
        })
        .collect()
}

/// Whether the data-row labels of `label_col` all share one shape, like
/// `2024-01`, `2024-02` or `Jan`, `Feb`
fn is_label_series(sheet: &Sheet, layout: &SheetLayout, label_col: u32) -> bool {
    let shapes: Vec<String> = sheet
        .column_cells(label_col)
        .into_iter()
        .filter(|c| layout.is_data_row(c.row) && c.is_label())
        .map(|c| label_shape(&c.value.to_string()))
        .collect();
    shapes.len() >= 2 && shapes.iter().all(|shape| *shape == shapes[0])
}

fn parse_sheet<'a>(sheet: &'a Sheet) -> Vec<ParsedCell<'a>> {
    let mut cells: Vec<ParsedCell<'a>> = sheet
        .formula_cells()
        .filter_map(|cell| {
            let formula = cell.formula.as_deref()?;
            Some(ParsedCell {
                sheet: &sheet.name,
                row: cell.row,
                col: cell.col,
                formula,
                tokens: tokenize(formula),
            })
        })
        .collect();
    cells.sort_by_key(|c| (c.col, c.row));
    cells
}

/// Split the formula cells of one sheet into single-cell and column-rule groups.
///
/// Cells arrive ordered by (col, row).
fn group_cells<'a>(
    cells: &'a [ParsedCell<'a>],
    cyclic: &BTreeSet<Node>,
    min_rule_rows: usize,
) -> Vec<Group<'a>> {
    let mut groups = Vec::new();
    let mut run: Vec<(&'a ParsedCell<'a>, String)> = Vec::new();

    let flush = |run: &mut Vec<(&'a ParsedCell<'a>, String)>, groups: &mut Vec<Group<'a>>| {
        if run.len() >= min_rule_rows {
            groups.push(Group {
                cells: run.iter().map(|(c, _)| *c).collect(),
                rule: true,
                cyclic: false,
            });
        } else {
            groups.extend(run.iter().map(|(c, _)| Group {
                cells: vec![*c],
                rule: false,
                cyclic: false,
            }));
        }
        run.clear();
    };

    for cell in cells {
        if cyclic.contains(&(cell.sheet.to_string(), cell.row, cell.col)) {
            flush(&mut run, &mut groups);
            groups.push(Group {
                cells: vec![cell],
                rule: false,
                cyclic: true,
            });
            continue;
        }

        let signature = relative_signature(&cell.tokens, cell.row, cell.col);
        let continues = run.last().is_some_and(|(prev, prev_sig)| {
            prev.col == cell.col && prev.row + 1 == cell.row && *prev_sig == signature
        });
        if !continues {
            flush(&mut run, &mut groups);
        }
        run.push((cell, signature));
    }
    flush(&mut run, &mut groups);

    groups
}

/// Display name: the column header for rules; the row label, with the header
/// where needed, for single cells
fn measure_name(group: &Group<'_>, sheet: &Sheet, layout: &SheetLayout) -> String {
    let first = group.first();
    let header = layout
        .header_label(first.col)
        .filter(|_| layout.is_data_row(first.row));

    if group.rule {
        if let Some(header) = header {
            return header.to_string();
        }
        return format!("Column {}", crate::reference::col_to_letter(first.col));
    }

    // A row label names the cell on its own unless the labels are a series or
    // the row holds other formulas that the header tells apart
    let label = row_label(sheet, first.row, first.col);
    let shared_row = sheet
        .row_cells(first.row)
        .iter()
        .any(|c| c.col != first.col && c.formula.is_some());
    let header = match label {
        Some((label_col, _)) if !shared_row && !is_label_series(sheet, layout, label_col) => None,
        _ => header,
    };
    let parts: Vec<&str> = label.map(|(_, label)| label).into_iter().chain(header).collect();
    if parts.is_empty() {
        group.address()
    } else {
        parts.join(" ")
    }
}

/// Extract measure records for every formula in the workbook.
///
/// Output order is workbook sheet order, then column, then row, and does not
/// depend on hash ordering: two runs over the same snapshot serialise identically.
pub fn extract_measures(workbook: &Workbook, config: &SenseConfig) -> Vec<MeasureRecord> {
    let parsed: Vec<Vec<ParsedCell<'_>>> = workbook.sheets.par_iter().map(parse_sheet).collect();
    let layouts: HashMap<&str, SheetLayout> = workbook
        .sheets
        .iter()
        .map(|sheet| {
            let forced = config.sheet(&sheet.name).and_then(|s| s.header_row);
            (sheet.name.as_str(), SheetLayout::detect(sheet, forced))
        })
        .collect();

    let graph = dependency_graph(
        workbook,
        parsed
            .iter()
            .flatten()
            .map(|c| (c.sheet, c.row, c.col, c.tokens.as_slice())),
    );
    let cyclic = cyclic_nodes(&graph);
    if !cyclic.is_empty() {
        let cells: Vec<String> = cyclic
            .iter()
            .map(|(s, r, c)| format!("{}!{}", s, CellReference::new(*r, *c)))
            .collect();
        warn!(cells = %cells.join(", "), "circular references found, keeping raw formulas");
    }

    let min_rule_rows = config.extraction.min_column_rule_rows.max(2);
    let sheet_groups: Vec<(&Sheet, Vec<Group<'_>>)> = workbook
        .sheets
        .iter()
        .zip(parsed.iter())
        .filter(|(sheet, _)| !config.is_sheet_skipped(&sheet.name))
        .map(|(sheet, cells)| (sheet, group_cells(cells, &cyclic, min_rule_rows)))
        .collect();

    // Names and ids first, so formulas can refer to other measures by id
    let mut resolver = Resolver::new(workbook, &layouts);
    let mut used_ids = HashSet::new();
    let mut named: Vec<(String, String)> = Vec::new();
    for (sheet, groups) in &sheet_groups {
        let layout = &layouts[sheet.name.as_str()];
        for group in groups {
            let name = measure_name(group, sheet, layout);
            let base = format!("{}.{}", slug(&sheet.name), slug(&name));
            let mut id = base.clone();
            if !used_ids.insert(id.clone()) {
                let suffix = group.address().to_lowercase().replace(':', "_");
                id = format!("{}_{}", base, suffix);
                let mut n = 2;
                while !used_ids.insert(id.clone()) {
                    id = format!("{}_{}_{}", base, suffix, n);
                    n += 1;
                }
            }
            for cell in &group.cells {
                resolver
                    .measure_ids
                    .insert((sheet.name.clone(), cell.row, cell.col), id.clone());
            }
            named.push((id, name));
        }
    }

    let volatile: HashSet<String> = config
        .extraction
        .volatile_functions
        .iter()
        .map(|f| f.to_uppercase())
        .collect();

    let mut records = Vec::with_capacity(named.len());
    let mut named = named.into_iter();
    for (sheet, groups) in &sheet_groups {
        for group in groups {
            let Some((id, name)) = named.next() else {
                break;
            };
            let record = build_record(workbook, &resolver, &volatile, sheet, group, id, name);
            if record.has_flag(MeasureFlag::PartialResolution) {
                warn!(measure = %record.id, formula = %record.raw_formula, "formula reads an external or missing sheet");
            }
            records.push(record);
        }
    }

    debug!(measures = records.len(), "computational extraction");
    records
}

fn build_record(
    workbook: &Workbook,
    resolver: &Resolver<'_>,
    volatile: &HashSet<String>,
    sheet: &Sheet,
    group: &Group<'_>,
    id: String,
    name: String,
) -> MeasureRecord {
    let first = group.first();
    let raw_formula = format!("={}", first.formula.trim().trim_start_matches('='));

    let mut flags = BTreeSet::new();
    if group.cyclic {
        flags.insert(MeasureFlag::Cyclic);
    }
    if function_names(&first.tokens)
        .iter()
        .any(|f| volatile.contains(f))
    {
        flags.insert(MeasureFlag::Volatile);
    }
    if references(&first.tokens).any(|r| target_sheet(workbook, r, first.sheet).is_none()) {
        flags.insert(MeasureFlag::PartialResolution);
    }

    let mut depends_on = BTreeSet::new();
    let semantic_formula = if group.cyclic {
        raw_formula.clone()
    } else {
        let tokens: Vec<Token> = first
            .tokens
            .iter()
            .map(|token| match token {
                Token::Name(name) => match workbook
                    .defined_names
                    .keys()
                    .find(|n| n.eq_ignore_ascii_case(name))
                {
                    Some(defined) => {
                        let ident = slug(defined);
                        depends_on.insert(ident.clone());
                        Token::Name(ident)
                    }
                    None => token.clone(),
                },
                _ => token.clone(),
            })
            .collect();
        render_with(&tokens, |reference| {
            let resolved = resolver.resolve(reference, first);
            depends_on.extend(resolved.lineage);
            resolved.text
        })
    };

    let column_rule = group.rule.then(|| {
        let last = group.cells[group.cells.len() - 1];
        ColumnRule {
            pattern: row_pattern(&first.tokens, first.row),
            first_row: first.row + 1,
            last_row: last.row + 1,
            rows: group.cells.len(),
        }
    });

    // A measure never lists itself
    depends_on.remove(&id);

    MeasureRecord {
        id,
        name,
        sheet: sheet.name.clone(),
        address: group.address(),
        column_index: first.col,
        raw_formula,
        semantic_formula,
        column_rule,
        depends_on: depends_on.into_iter().collect(),
        flags: flags.into_iter().collect(),
    }
}
