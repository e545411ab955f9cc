//! sheetsense-core: semantic retrieval and question answering over spreadsheets
//!
//! Workbooks are turned into two kinds of records, one per column and one per
//! formula (or repeated formula pattern). Both are embedded into a
//! per-spreadsheet index that a bounded agent loop searches, verifies against
//! live values and explains.

pub mod agent;
pub mod config;
pub mod embed;
pub mod error;
pub mod extract;
pub mod index;
pub mod reader;
pub mod reasoning;
pub mod records;
pub mod reference;
pub mod retry;
pub mod source;
pub mod tools;

use std::sync::Arc;

pub use agent::{Outcome, QueryOrchestrator, QueryRequest, QueryResponse, QuerySession, RankedResult};
pub use config::SenseConfig;
pub use embed::{Embedder, HashingEmbedder};
pub use error::{SenseError, SenseResult, ServiceError};
pub use extract::Extraction;
pub use index::{IndexSnapshot, SemanticIndexStore};
pub use reader::{Workbook, read_workbook};
pub use reasoning::{HeuristicReasoner, Intent, ReasoningService};
pub use records::{IndexKind, IndexedRecord, MeasureFlag, MeasureRecord, Provenance, StructuralRecord};
pub use retry::{CancellationToken, RetryPolicy};
pub use source::{LiveValue, SnapshotSource, SpreadsheetSource};

/// Main engine interface: extraction, indexing and querying
pub struct SheetSense {
    config: SenseConfig,
    store: SemanticIndexStore,
    reasoner: Arc<dyn ReasoningService>,
}

impl SheetSense {
    /// Create an engine with the collaborators selected in the configuration
    pub fn new(config: SenseConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let embedder = embed::build_embedder(&config)?;
        let reasoner = reasoning::build_reasoner(&config)?;
        Ok(Self::with_services(config, embedder, reasoner))
    }

    /// Create an engine with explicit collaborators
    pub fn with_services(
        config: SenseConfig,
        embedder: Arc<dyn Embedder>,
        reasoner: Arc<dyn ReasoningService>,
    ) -> Self {
        let store = SemanticIndexStore::new(embedder, config.retry_policy());
        Self {
            config,
            store,
            reasoner,
        }
    }

    pub fn config(&self) -> &SenseConfig {
        &self.config
    }

    pub fn store(&self) -> &SemanticIndexStore {
        &self.store
    }

    /// Structural and computational records of a workbook
    pub fn extract(&self, workbook: &Workbook) -> SenseResult<Extraction> {
        extract::extract(workbook, &self.config)
    }

    /// Extract and index a workbook under its content fingerprint
    pub fn index_workbook(
        &self,
        workbook: &Workbook,
        cancel: &CancellationToken,
    ) -> SenseResult<Arc<IndexSnapshot>> {
        self.index_as(&workbook.fingerprint(), workbook, cancel)
    }

    /// Extract and index a workbook under a caller-chosen identifier
    pub fn index_as(
        &self,
        spreadsheet_id: &str,
        workbook: &Workbook,
        cancel: &CancellationToken,
    ) -> SenseResult<Arc<IndexSnapshot>> {
        let extraction = self.extract(workbook)?;
        self.store.rebuild(
            spreadsheet_id,
            extraction.structural,
            extraction.measures,
            cancel,
        )
    }

    /// Answer one query turn
    pub fn ask(
        &self,
        request: QueryRequest,
        source: &dyn SpreadsheetSource,
        cancel: &CancellationToken,
    ) -> SenseResult<QueryResponse> {
        QueryOrchestrator::new(&self.config, &self.store, self.reasoner.as_ref())
            .answer(request, source, cancel)
    }
}
