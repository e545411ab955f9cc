//! Retrieval tools available to the orchestrator

use crate::embed::Embedder;
use crate::error::SenseResult;
use crate::index::IndexSnapshot;
use crate::records::{IndexKind, RetrievalResult};
use crate::retry::RetryPolicy;
use crate::source::{LiveValue, SpreadsheetSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// The closed set of tool invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    /// Structural index search
    SearchSpec { query: String, k: usize },
    /// Computational index search
    SearchMeasures { query: String, k: usize },
    /// Live point read
    GetCellValue { sheet: String, address: String },
    /// Live row read, 1-based row
    GetRowValues { sheet: String, row: u32 },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::SearchSpec { .. } => "search_spec",
            ToolCall::SearchMeasures { .. } => "search_measures",
            ToolCall::GetCellValue { .. } => "get_cell_value",
            ToolCall::GetRowValues { .. } => "get_row_values",
        }
    }

    pub fn is_live_read(&self) -> bool {
        matches!(
            self,
            ToolCall::GetCellValue { .. } | ToolCall::GetRowValues { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum ToolOutput {
    Matches(Vec<RetrievalResult>),
    Cell(LiveValue),
    Row(Vec<LiveValue>),
}

impl ToolOutput {
    /// One-line description handed to the reasoning service
    pub fn summary(&self) -> String {
        match self {
            ToolOutput::Matches(results) => {
                let top: Vec<String> = results
                    .iter()
                    .take(3)
                    .map(|r| format!("{} ({:.2})", r.record.label(), r.score))
                    .collect();
                format!("{} match(es): {}", results.len(), top.join(", "))
            }
            ToolOutput::Cell(value) => format!("{}!{} = {}", value.sheet, value.address, value.value),
            ToolOutput::Row(values) => {
                let cells: Vec<String> = values
                    .iter()
                    .map(|v| format!("{}={}", v.address, v.value))
                    .collect();
                format!("row: {}", cells.join(", "))
            }
        }
    }
}

/// Tools bound to one index snapshot and one spreadsheet source
pub struct Toolbox<'a> {
    snapshot: Arc<IndexSnapshot>,
    embedder: &'a dyn Embedder,
    source: &'a dyn SpreadsheetSource,
    retry: RetryPolicy,
}

impl<'a> Toolbox<'a> {
    pub fn new(
        snapshot: Arc<IndexSnapshot>,
        embedder: &'a dyn Embedder,
        source: &'a dyn SpreadsheetSource,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            snapshot,
            embedder,
            source,
            retry,
        }
    }

    pub fn snapshot(&self) -> &Arc<IndexSnapshot> {
        &self.snapshot
    }

    fn search(&self, kind: IndexKind, query: &str, k: usize) -> SenseResult<Vec<RetrievalResult>> {
        if self.snapshot.index(kind).is_empty() {
            return Ok(Vec::new());
        }
        let service = format!("embedding ({})", self.embedder.name());
        let vector = self.retry.run(&service, || self.embedder.embed(query))?;
        Ok(self.snapshot.search(kind, &vector, k))
    }

    pub fn search_spec(&self, query: &str, k: usize) -> SenseResult<Vec<RetrievalResult>> {
        self.search(IndexKind::Structural, query, k)
    }

    pub fn search_measures(&self, query: &str, k: usize) -> SenseResult<Vec<RetrievalResult>> {
        self.search(IndexKind::Computational, query, k)
    }

    pub fn get_cell_value(&self, sheet: &str, address: &str) -> SenseResult<LiveValue> {
        self.retry
            .run("spreadsheet read", || self.source.get_cell_value(sheet, address))
    }

    pub fn get_row_values(&self, sheet: &str, row: u32) -> SenseResult<Vec<LiveValue>> {
        self.retry
            .run("spreadsheet read", || self.source.get_row_values(sheet, row))
    }

    /// Run one tool call
    pub fn execute(&self, call: &ToolCall) -> SenseResult<ToolOutput> {
        debug!(tool = call.name(), ?call, "tool call");
        Ok(match call {
            ToolCall::SearchSpec { query, k } => ToolOutput::Matches(self.search_spec(query, *k)?),
            ToolCall::SearchMeasures { query, k } => {
                ToolOutput::Matches(self.search_measures(query, *k)?)
            }
            ToolCall::GetCellValue { sheet, address } => {
                ToolOutput::Cell(self.get_cell_value(sheet, address)?)
            }
            ToolCall::GetRowValues { sheet, row } => {
                ToolOutput::Row(self.get_row_values(sheet, *row)?)
            }
        })
    }
}
