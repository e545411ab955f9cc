//! Formula dependency graph and circular reference detection

use super::formula::{Reference, Token, references};
use super::target_sheet;
use crate::reader::Workbook;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Graph node: (sheet, row, col)
pub type Node = (String, u32, u32);

/// Formula cells of the workbook, indexed per sheet by (col, row) for range lookups
pub struct FormulaGrid {
    cells: HashMap<String, BTreeSet<(u32, u32)>>,
}

impl FormulaGrid {
    pub fn new(workbook: &Workbook) -> Self {
        let cells = workbook
            .sheets
            .iter()
            .map(|sheet| {
                let set = sheet.formula_cells().map(|c| (c.col, c.row)).collect();
                (sheet.name.clone(), set)
            })
            .collect();
        Self { cells }
    }

    /// Formula cells covered by `reference` on `sheet`
    pub fn covered(&self, sheet: &str, reference: &Reference) -> Vec<(u32, u32)> {
        let Some(set) = self.cells.get(sheet) else {
            return Vec::new();
        };
        let (c1, c2, r1, r2) = reference.bounds();
        let (r1, r2) = (r1.unwrap_or(0), r2.unwrap_or(u32::MAX));
        set.range((c1, r1)..=(c2, r2))
            .filter(|(_, row)| *row >= r1 && *row <= r2)
            .map(|&(col, row)| (row, col))
            .collect()
    }
}

/// Build the reference graph between formula cells.
///
/// Every formula cell is a key, even when it reads no other formula cell.
/// External references and references to missing sheets contribute no edge.
pub fn dependency_graph<'a, I>(workbook: &Workbook, formulas: I) -> BTreeMap<Node, Vec<Node>>
where
    I: IntoIterator<Item = (&'a str, u32, u32, &'a [Token])>,
{
    let grid = FormulaGrid::new(workbook);
    let mut graph = BTreeMap::new();

    for (sheet, row, col, tokens) in formulas {
        let mut edges = Vec::new();
        for reference in references(tokens) {
            if reference.external.is_some() {
                continue;
            }
            let Some(target) = target_sheet(workbook, reference, sheet) else {
                continue;
            };
            for (r, c) in grid.covered(&target.name, reference) {
                edges.push((target.name.clone(), r, c));
            }
        }
        edges.sort();
        edges.dedup();
        graph.insert((sheet.to_string(), row, col), edges);
    }

    graph
}

struct Frame {
    node: usize,
    next_edge: usize,
}

/// Nodes that sit on a cycle: members of a strongly connected component with
/// more than one node, or nodes referencing themselves.
///
/// Iterative Tarjan, so long dependency chains cannot overflow the stack.
pub fn cyclic_nodes(graph: &BTreeMap<Node, Vec<Node>>) -> BTreeSet<Node> {
    let nodes: Vec<&Node> = graph.keys().collect();
    let position: HashMap<&Node, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let adjacency: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| {
            graph[*n]
                .iter()
                .filter_map(|dep| position.get(dep).copied())
                .collect()
        })
        .collect();

    let count = nodes.len();
    let mut index = vec![usize::MAX; count];
    let mut lowlink = vec![0usize; count];
    let mut on_stack = vec![false; count];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut cyclic = BTreeSet::new();

    for root in 0..count {
        if index[root] != usize::MAX {
            continue;
        }
        let mut frames = vec![Frame {
            node: root,
            next_edge: 0,
        }];
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = frames.last_mut() {
            let v = frame.node;
            if let Some(&w) = adjacency[v].get(frame.next_edge) {
                frame.next_edge += 1;
                if index[w] == usize::MAX {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    frames.push(Frame {
                        node: w,
                        next_edge: 0,
                    });
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
                continue;
            }

            frames.pop();
            if let Some(parent) = frames.last() {
                lowlink[parent.node] = lowlink[parent.node].min(lowlink[v]);
            }

            if lowlink[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let self_loop = component.len() == 1 && adjacency[v].contains(&v);
                if component.len() > 1 || self_loop {
                    cyclic.extend(component.into_iter().map(|i| nodes[i].clone()));
                }
            }
        }
    }

    cyclic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::formula::tokenize;
    use crate::reader::workbook::{CellValue, Sheet};

    fn graph_for(workbook: &Workbook) -> BTreeMap<Node, Vec<Node>> {
        let parsed: Vec<(String, u32, u32, Vec<Token>)> = workbook
            .sheets
            .iter()
            .flat_map(|s| {
                s.formula_cells().map(move |c| {
                    (
                        s.name.clone(),
                        c.row,
                        c.col,
                        tokenize(c.formula.as_deref().unwrap_or_default()),
                    )
                })
            })
            .collect();
        dependency_graph(
            workbook,
            parsed
                .iter()
                .map(|(s, r, c, t)| (s.as_str(), *r, *c, t.as_slice())),
        )
    }

    #[test]
    fn test_two_cell_cycle() {
        let mut sheet = Sheet::new("Sheet1");
        sheet.set_formula(0, 0, "B1+1", CellValue::Number(0.0));
        sheet.set_formula(0, 1, "A1+1", CellValue::Number(0.0));
        sheet.set_formula(0, 2, "A1*2", CellValue::Number(0.0));
        let workbook = Workbook::from_sheets(vec![sheet]);

        let cyclic = cyclic_nodes(&graph_for(&workbook));
        assert!(cyclic.contains(&("Sheet1".to_string(), 0, 0)));
        assert!(cyclic.contains(&("Sheet1".to_string(), 0, 1)));
        // Reads the cycle but is not part of it
        assert!(!cyclic.contains(&("Sheet1".to_string(), 0, 2)));
    }

    #[test]
    fn test_self_reference_through_range() {
        let mut sheet = Sheet::new("Data");
        sheet.set_value(0, 0, CellValue::Number(1.0));
        sheet.set_formula(5, 0, "SUM(A1:A10)", CellValue::Number(1.0));
        let workbook = Workbook::from_sheets(vec![sheet]);

        let cyclic = cyclic_nodes(&graph_for(&workbook));
        assert_eq!(cyclic.len(), 1);
    }

    #[test]
    fn test_cross_sheet_cycle() {
        let mut a = Sheet::new("First");
        a.set_formula(0, 0, "Second!A1", CellValue::Number(0.0));
        let mut b = Sheet::new("Second");
        b.set_formula(0, 0, "first!A1", CellValue::Number(0.0));
        let workbook = Workbook::from_sheets(vec![a, b]);

        let cyclic = cyclic_nodes(&graph_for(&workbook));
        assert_eq!(cyclic.len(), 2);
    }

    #[test]
    fn test_acyclic_chain() {
        let mut sheet = Sheet::new("Sheet1");
        for row in 1..50 {
            sheet.set_formula(row, 0, format!("A{}+1", row), CellValue::Number(0.0));
        }
        let workbook = Workbook::from_sheets(vec![sheet]);
        assert!(cyclic_nodes(&graph_for(&workbook)).is_empty());
    }
}
