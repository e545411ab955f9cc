use sheetsense_core::config::MAX_REFINEMENT_ITERATIONS;
use sheetsense_core::index::QueryInput;
use sheetsense_core::reader::{CellValue, Sheet, Workbook};
use sheetsense_core::reasoning::{ReasoningRequest, ReasoningResponse};
use sheetsense_core::{
    CancellationToken, Embedder, HashingEmbedder, HeuristicReasoner, IndexedRecord, LiveValue,
    Outcome, QueryRequest, ReasoningService, SemanticIndexStore, SenseConfig, SenseError,
    ServiceError, SheetSense, SnapshotSource, SpreadsheetSource, RetryPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn text(value: &str) -> CellValue {
    CellValue::Text(value.to_string())
}

fn income_sheet(margin_header: &str) -> Sheet {
    let mut sheet = Sheet::new("Income");
    for (col, header) in ["Month", "Revenue", "Cost of Goods", margin_header]
        .iter()
        .enumerate()
    {
        sheet.set_value(0, col as u32, text(header));
    }
    for (i, (revenue, cost)) in [(100.0, 60.0), (120.0, 66.0), (150.0, 90.0)].iter().enumerate() {
        let row = i as u32 + 1;
        let r = row + 1;
        sheet.set_value(row, 0, text(&format!("2024-0{}", row)));
        sheet.set_value(row, 1, CellValue::Number(*revenue));
        sheet.set_value(row, 2, CellValue::Number(*cost));
        sheet.set_formula(
            row,
            3,
            format!("(B{r}-C{r})/B{r}"),
            CellValue::Number((revenue - cost) / revenue),
        );
    }
    sheet
}

fn headcount_sheet() -> Sheet {
    let mut sheet = Sheet::new("Staff");
    for (col, header) in ["Team", "Headcount", "Salary"].iter().enumerate() {
        sheet.set_value(0, col as u32, text(header));
    }
    for (i, (team, heads, salary)) in [("Ops", 4.0, 50.0), ("Sales", 6.0, 55.0)].iter().enumerate() {
        let row = i as u32 + 1;
        sheet.set_value(row, 0, text(team));
        sheet.set_value(row, 1, CellValue::Number(*heads));
        sheet.set_value(row, 2, CellValue::Number(*salary));
    }
    sheet
}

fn workbook() -> Workbook {
    Workbook::from_sheets(vec![income_sheet("Gross Margin"), headcount_sheet()])
}

fn engine(config: SenseConfig) -> SheetSense {
    let margin = config.retrieval.ambiguity_margin;
    SheetSense::with_services(
        config,
        Arc::new(HashingEmbedder::new(512)),
        Arc::new(HeuristicReasoner::new(margin)),
    )
}

fn no_wait_config() -> SenseConfig {
    let mut config = SenseConfig::default();
    config.services.initial_backoff_ms = 0;
    config.services.max_backoff_ms = 0;
    config
}

#[test]
fn test_gross_margin_question_cites_formula() {
    let engine = engine(SenseConfig::default());
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    let response = engine
        .ask(
            QueryRequest::new("book", "How is gross margin calculated?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();

    let top = &response.outcome.results()[0];
    let measure = top.record.as_measure().unwrap();
    assert_eq!(measure.semantic_formula, "(revenue - cost_of_goods) / revenue");
    assert_eq!(top.provenance.sheet, "Income");
    assert_eq!(top.provenance.address, "D2:D4");
    assert_eq!(top.provenance.formula.as_deref(), Some("=(B2-C2)/B2"));
    assert!(top.rationale.contains("(revenue - cost_of_goods) / revenue"));
}

#[test]
fn test_upserted_records_retrieve_themselves() {
    let config = SenseConfig::default();
    let extraction = engine(config.clone()).extract(&workbook()).unwrap();
    let store = SemanticIndexStore::new(Arc::new(HashingEmbedder::new(512)), RetryPolicy::none());

    let records: Vec<IndexedRecord> = extraction
        .structural
        .into_iter()
        .map(IndexedRecord::Structural)
        .chain(extraction.measures.into_iter().map(IndexedRecord::Measure))
        .collect();
    for record in &records {
        store.upsert("book", record.clone()).unwrap();
    }

    for record in &records {
        let results = store
            .query("book", record.kind(), QueryInput::Text(record.projection()), 1)
            .unwrap();
        assert_eq!(results[0].record.key(), record.key());
        assert_eq!(results[0].rank, 1);
    }
}

#[test]
fn test_every_query_terminates_within_iteration_budget() {
    let mut config = SenseConfig::default();
    config.retrieval.max_iterations = 3;
    let engine = engine(config);
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    let queries = [
        "How is gross margin calculated?",
        "Which columns are on the Staff sheet?",
        "What is the current headcount?",
        "What feeds the gross margin column and what are its current values?",
        "Tell me about the weather on Mars",
        "How is EBITDA calculated?",
        "What is in row 2 of Staff?",
        "",
    ];
    for query in queries {
        let response = engine
            .ask(QueryRequest::new("book", query), &source, &CancellationToken::new())
            .unwrap();
        assert!(response.session.iterations <= MAX_REFINEMENT_ITERATIONS, "{}", query);
        assert!(
            response
                .session
                .invocations
                .iter()
                .all(|inv| inv.iteration <= MAX_REFINEMENT_ITERATIONS)
        );
        match &response.outcome {
            Outcome::Clarification { question } => {
                assert!(!question.is_empty());
                assert_eq!(response.session.iterations, 0);
            }
            Outcome::Answer { results } => {
                assert!(!results.is_empty());
                assert!(results.iter().any(|r| r.confident));
            }
            Outcome::LowConfidence { results } => {
                assert!(results.len() <= 5);
            }
        }
    }
}

#[test]
fn test_row_mention_reads_the_row() {
    let engine = engine(SenseConfig::default());
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    let response = engine
        .ask(
            QueryRequest::new("book", "Which columns hold the values in row 2 of Staff?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();
    let row_read = response
        .session
        .invocations
        .iter()
        .find(|inv| inv.call.name() == "get_row_values")
        .unwrap();
    assert!(row_read.summary.contains("A2=Ops"));
}

#[test]
fn test_mention_of_missing_sheet_is_logged_not_fatal() {
    let engine = engine(SenseConfig::default());
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    let response = engine
        .ask(
            QueryRequest::new("book", "What is the current revenue in Budget!B5?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();

    let read = response
        .session
        .invocations
        .iter()
        .find(|inv| inv.call.is_live_read())
        .unwrap();
    assert_eq!(read.iteration, 1);
    assert_eq!(read.summary, "not found: sheet 'Budget'");
    assert!(
        response
            .outcome
            .results()
            .iter()
            .any(|r| r.record.label() == "Revenue")
    );
}

#[test]
fn test_invocation_log_covers_every_iteration() {
    let mut config = SenseConfig::default();
    config.retrieval.similarity_threshold = 1.0;
    let engine = engine(config);
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    let response = engine
        .ask(
            QueryRequest::new("book", "Show the revenue column"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();
    let session = &response.session;
    assert!(matches!(response.outcome, Outcome::LowConfidence { .. }));
    assert_eq!(session.iterations, MAX_REFINEMENT_ITERATIONS);

    for iteration in 0..=session.iterations {
        assert!(
            session.invocations.iter().any(|inv| inv.iteration == iteration),
            "no tool call logged for iteration {}",
            iteration
        );
    }

    // Iteration 1 repeats the intent-analysis search and is served from the cache
    let repeated = session
        .invocations
        .iter()
        .find(|inv| inv.iteration == 1 && inv.call.name() == "search_spec")
        .unwrap();
    assert!(repeated.cached);
    let original = session
        .invocations
        .iter()
        .find(|inv| inv.iteration == 0 && inv.call.name() == "search_spec")
        .unwrap();
    assert!(!original.cached);
    assert_eq!(repeated.summary, original.summary);
}

#[test]
fn test_ambiguous_query_asks_then_resumes() {
    let mut config = SenseConfig::default();
    config.retrieval.ambiguity_margin = 0.2;
    let engine = engine(config);

    let mut sales = Sheet::new("Sales");
    let mut costs = Sheet::new("Costs");
    for sheet in [&mut sales, &mut costs] {
        sheet.set_value(0, 0, text("Item"));
        sheet.set_value(0, 1, text("Total"));
        sheet.set_value(1, 0, text("Widgets"));
        sheet.set_value(1, 1, CellValue::Number(10.0));
    }
    let workbook = Workbook::from_sheets(vec![sales, costs]);
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));
    let cancel = CancellationToken::new();

    let first = engine
        .ask(QueryRequest::new("book", "total"), &source, &cancel)
        .unwrap();
    let Outcome::Clarification { question } = &first.outcome else {
        panic!("expected a clarification, got {:?}", first.outcome);
    };
    assert!(question.contains("Sales") && question.contains("Costs"));

    let second = engine
        .ask(
            QueryRequest::new("book", "the total column on the Sales sheet")
                .with_prior(first.session),
            &source,
            &cancel,
        )
        .unwrap();
    let top = &second.outcome.results()[0];
    assert_eq!(top.record.sheet(), "Sales");
    assert_eq!(top.record.label(), "Total");
}

/// Rebuilds the index the first time a live value is read
struct RebuildingSource<'a> {
    engine: &'a SheetSense,
    replacement: Workbook,
    inner: SnapshotSource,
    rebuilt: AtomicBool,
}

impl SpreadsheetSource for RebuildingSource<'_> {
    fn get_cell_value(&self, sheet: &str, address: &str) -> Result<LiveValue, ServiceError> {
        if !self.rebuilt.swap(true, Ordering::SeqCst) {
            self.engine
                .index_as("book", &self.replacement, &CancellationToken::new())
                .map_err(|e| ServiceError::Permanent(e.to_string()))?;
        }
        self.inner.get_cell_value(sheet, address)
    }

    fn get_row_values(&self, sheet: &str, row: u32) -> Result<Vec<LiveValue>, ServiceError> {
        self.inner.get_row_values(sheet, row)
    }
}

#[test]
fn test_rebuild_during_query_is_not_observed() {
    let engine = engine(SenseConfig::default());
    let original = workbook();
    let pinned = engine
        .index_as("book", &original, &CancellationToken::new())
        .unwrap();

    let source = RebuildingSource {
        engine: &engine,
        replacement: Workbook::from_sheets(vec![income_sheet("Net Ratio")]),
        inner: SnapshotSource::new(Arc::new(original)),
        rebuilt: AtomicBool::new(false),
    };

    let response = engine
        .ask(
            QueryRequest::new("book", "What is the current gross margin?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(source.rebuilt.load(Ordering::SeqCst));
    assert_eq!(engine.store().snapshot("book").unwrap().generation, 2);
    assert_eq!(response.session.generation, pinned.generation);
    assert!(Arc::ptr_eq(response.session.snapshot().unwrap(), &pinned));
    for result in response.outcome.results() {
        assert!(pinned.record(&result.record.key()).is_some());
    }
    assert!(
        response
            .outcome
            .results()
            .iter()
            .any(|r| r.record.label() == "Gross Margin")
    );
}

/// Cancels the session on its first live read
struct CancellingSource {
    cancel: CancellationToken,
    inner: SnapshotSource,
}

impl SpreadsheetSource for CancellingSource {
    fn get_cell_value(&self, sheet: &str, address: &str) -> Result<LiveValue, ServiceError> {
        self.cancel.cancel();
        self.inner.get_cell_value(sheet, address)
    }

    fn get_row_values(&self, sheet: &str, row: u32) -> Result<Vec<LiveValue>, ServiceError> {
        self.cancel.cancel();
        self.inner.get_row_values(sheet, row)
    }
}

#[test]
fn test_cancellation_between_iterations() {
    let engine = engine(SenseConfig::default());
    let workbook = workbook();
    let before = engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let cancel = CancellationToken::new();
    let source = CancellingSource {
        cancel: cancel.clone(),
        inner: SnapshotSource::new(Arc::new(workbook.clone())),
    };

    let err = engine
        .ask(
            QueryRequest::new("book", "What is the current gross margin?"),
            &source,
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, SenseError::Cancelled));

    // A cancelled rebuild leaves the published index alone
    let err = engine.index_as("book", &workbook, &cancel).unwrap_err();
    assert!(matches!(err, SenseError::Cancelled));
    assert!(Arc::ptr_eq(&engine.store().snapshot("book").unwrap(), &before));
}

/// Embeds normally until switched off, then fails transiently
struct FlakyEmbedder {
    inner: HashingEmbedder,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl Embedder for FlakyEmbedder {
    fn name(&self) -> &str {
        "flaky"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(ServiceError::Transient("503 service unavailable".into()));
        }
        self.inner.embed(text)
    }
}

#[test]
fn test_exhausted_embedding_retries_end_the_session() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: HashingEmbedder::new(128),
        failing: AtomicBool::new(false),
        failures: AtomicUsize::new(0),
    });
    let config = no_wait_config();
    let engine = SheetSense::with_services(
        config.clone(),
        embedder.clone(),
        Arc::new(HeuristicReasoner::new(config.retrieval.ambiguity_margin)),
    );
    let workbook = workbook();
    engine
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook));

    embedder.failing.store(true, Ordering::SeqCst);
    let err = engine
        .ask(
            QueryRequest::new("book", "How is gross margin calculated?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap_err();
    match err {
        SenseError::ExternalService {
            service, attempts, ..
        } => {
            assert_eq!(service, "embedding (flaky)");
            assert_eq!(attempts, config.services.max_attempts);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(embedder.failures.load(Ordering::SeqCst), config.services.max_attempts);

    // The index survives the failed session
    assert!(engine.store().snapshot("book").is_ok());
}

/// Reasoner that fails a fixed number of times before delegating
struct UnreliableReasoner {
    inner: HeuristicReasoner,
    remaining_failures: Mutex<usize>,
}

impl ReasoningService for UnreliableReasoner {
    fn name(&self) -> &str {
        "unreliable"
    }

    fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ServiceError::Transient("timed out".into()));
        }
        drop(remaining);
        self.inner.reason(request)
    }
}

#[test]
fn test_reasoning_retries_recover_or_fail() {
    let config = no_wait_config();
    let workbook = workbook();

    let flaky_once = SheetSense::with_services(
        config.clone(),
        Arc::new(HashingEmbedder::new(512)),
        Arc::new(UnreliableReasoner {
            inner: HeuristicReasoner::new(0.03),
            remaining_failures: Mutex::new(1),
        }),
    );
    flaky_once
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let source = SnapshotSource::new(Arc::new(workbook.clone()));
    let response = flaky_once
        .ask(
            QueryRequest::new("book", "How is gross margin calculated?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();
    assert!(!response.outcome.results().is_empty());

    let broken = SheetSense::with_services(
        config,
        Arc::new(HashingEmbedder::new(512)),
        Arc::new(UnreliableReasoner {
            inner: HeuristicReasoner::new(0.03),
            remaining_failures: Mutex::new(usize::MAX),
        }),
    );
    broken
        .index_as("book", &workbook, &CancellationToken::new())
        .unwrap();
    let err = broken
        .ask(
            QueryRequest::new("book", "How is gross margin calculated?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, SenseError::ExternalService { ref service, .. } if service == "reasoning (unreliable)"));
}

#[test]
fn test_unindexed_spreadsheet_needs_indexing() {
    let engine = engine(SenseConfig::default());
    let source = SnapshotSource::new(Arc::new(workbook()));
    let err = engine
        .ask(QueryRequest::new("nowhere", "revenue"), &source, &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "index_unavailable");
}

#[test]
fn test_saved_index_answers_like_a_fresh_one() {
    let engine = engine(SenseConfig::default());
    let workbook = workbook();
    let snapshot = engine
        .index_workbook(&workbook, &CancellationToken::new())
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    engine
        .store()
        .save_snapshot(&snapshot.spreadsheet_id, &path)
        .unwrap();

    let restored = self::engine(SenseConfig::default());
    let loaded = restored.store().load_snapshot(&path).unwrap();
    assert_eq!(loaded.spreadsheet_id, workbook.fingerprint());
    assert_eq!(loaded.len(), snapshot.len());

    let source = SnapshotSource::new(Arc::new(workbook));
    let response = restored
        .ask(
            QueryRequest::new(loaded.spreadsheet_id.clone(), "How is gross margin calculated?"),
            &source,
            &CancellationToken::new(),
        )
        .unwrap();
    assert_eq!(response.outcome.results()[0].record.label(), "Gross Margin");
}
