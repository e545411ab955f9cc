//! Per-spreadsheet semantic index store
//!
//! Each spreadsheet owns an immutable [`IndexSnapshot`] behind an `Arc`.
//! Writers build a new snapshot and swap it in; readers keep whatever
//! snapshot they cloned, so a rebuild is never observed half-way.

pub mod vector;

pub use vector::{FlatIndex, IndexEntry, UpsertOutcome};

use crate::embed::{Embedder, terms};
use crate::error::{SenseError, SenseResult};
use crate::records::{IndexKind, IndexedRecord, MeasureRecord, RetrievalResult, StructuralRecord};
use crate::retry::{CancellationToken, RetryPolicy};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Query by raw text (embedded first) or by a precomputed vector
#[derive(Debug, Clone)]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

/// Both indices of one spreadsheet at one point in time
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub spreadsheet_id: String,
    /// Bumped on every published change
    pub generation: u64,
    /// Embedder that produced the vectors
    pub embedder: String,
    pub dimension: usize,
    pub structural: FlatIndex,
    pub computational: FlatIndex,
}

impl IndexSnapshot {
    fn empty(spreadsheet_id: &str, embedder: &dyn Embedder) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.to_string(),
            generation: 0,
            embedder: embedder.name().to_string(),
            dimension: embedder.dimension(),
            structural: FlatIndex::new(),
            computational: FlatIndex::new(),
        }
    }

    pub fn index(&self, kind: IndexKind) -> &FlatIndex {
        match kind {
            IndexKind::Structural => &self.structural,
            IndexKind::Computational => &self.computational,
        }
    }

    fn index_mut(&mut self, kind: IndexKind) -> &mut FlatIndex {
        match kind {
            IndexKind::Structural => &mut self.structural,
            IndexKind::Computational => &mut self.computational,
        }
    }

    pub fn len(&self) -> usize {
        self.structural.len() + self.computational.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest neighbours of an already embedded query
    pub fn search(&self, kind: IndexKind, vector: &[f32], k: usize) -> Vec<RetrievalResult> {
        self.index(kind).search(vector, k)
    }

    /// Look a record up by key in either index
    pub fn record(&self, key: &str) -> Option<Arc<IndexedRecord>> {
        self.structural
            .get(key)
            .or_else(|| self.computational.get(key))
            .map(|e| Arc::clone(&e.record))
    }

    /// Every content word appearing in a record projection
    pub fn vocabulary(&self) -> BTreeSet<String> {
        self.structural
            .entries()
            .chain(self.computational.entries())
            .flat_map(|e| terms(&e.record.projection()))
            .collect()
    }
}

/// SHA-256 of the record's serialized content
pub fn content_hash(record: &IndexedRecord) -> SenseResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(record)?);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    content_hash: String,
    vector: Vec<f32>,
    record: IndexedRecord,
}

#[derive(Serialize, Deserialize)]
struct PersistedSnapshot {
    spreadsheet_id: String,
    generation: u64,
    embedder: String,
    dimension: usize,
    structural: Vec<PersistedEntry>,
    computational: Vec<PersistedEntry>,
}

/// Owner of every spreadsheet's indices and of the embedding work that fills them
pub struct SemanticIndexStore {
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    snapshots: RwLock<HashMap<String, Arc<IndexSnapshot>>>,
    /// Serialises writers; readers never take it
    writer: Mutex<()>,
}

impl SemanticIndexStore {
    pub fn new(embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            retry,
            snapshots: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Embed text through the retry policy
    pub fn embed(&self, text: &str) -> SenseResult<Vec<f32>> {
        let service = format!("embedding ({})", self.embedder.name());
        self.retry.run(&service, || self.embedder.embed(text))
    }

    /// Current snapshot of a spreadsheet
    pub fn snapshot(&self, spreadsheet_id: &str) -> SenseResult<Arc<IndexSnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(spreadsheet_id)
            .cloned()
            .ok_or_else(|| SenseError::IndexUnavailable {
                spreadsheet_id: spreadsheet_id.to_string(),
            })
    }

    /// Spreadsheets with a published snapshot, sorted
    pub fn spreadsheet_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn publish(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.spreadsheet_id.clone(), Arc::clone(&snapshot));
        snapshot
    }

    /// Insert or replace one record.
    ///
    /// A record whose content hash matches the stored entry is left alone
    /// and no new generation is published.
    pub fn upsert(&self, spreadsheet_id: &str, record: IndexedRecord) -> SenseResult<UpsertOutcome> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot(spreadsheet_id).ok();

        let kind = record.kind();
        let key = record.key();
        let hash = content_hash(&record)?;
        if let Some(existing) = current.as_ref().and_then(|s| s.index(kind).get(&key)) {
            if existing.content_hash == hash {
                debug!(spreadsheet_id, key = %key, "upsert unchanged");
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let vector = self.embed(&record.projection())?;
        let mut next = match current {
            Some(snapshot) => (*snapshot).clone(),
            None => IndexSnapshot::empty(spreadsheet_id, self.embedder.as_ref()),
        };
        let outcome = next.index_mut(kind).upsert(IndexEntry {
            key,
            content_hash: hash,
            vector,
            record: Arc::new(record),
        });
        next.generation += 1;
        self.publish(next);
        Ok(outcome)
    }

    /// Top-k records of one index
    pub fn query(
        &self,
        spreadsheet_id: &str,
        kind: IndexKind,
        input: QueryInput,
        k: usize,
    ) -> SenseResult<Vec<RetrievalResult>> {
        let snapshot = self.snapshot(spreadsheet_id)?;
        if snapshot.index(kind).is_empty() {
            return Ok(Vec::new());
        }
        let vector = match input {
            QueryInput::Text(text) => self.embed(&text)?,
            QueryInput::Vector(vector) => vector,
        };
        Ok(snapshot.search(kind, &vector, k))
    }

    /// Replace all records of a spreadsheet with a freshly embedded set.
    ///
    /// The new snapshot is built without touching the published one and swapped
    /// in at the end; on cancellation or embedding failure the old snapshot stays.
    pub fn rebuild(
        &self,
        spreadsheet_id: &str,
        structural: Vec<StructuralRecord>,
        measures: Vec<MeasureRecord>,
        cancel: &CancellationToken,
    ) -> SenseResult<Arc<IndexSnapshot>> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.checkpoint()?;

        let records: Vec<IndexedRecord> = structural
            .into_iter()
            .map(IndexedRecord::Structural)
            .chain(measures.into_iter().map(IndexedRecord::Measure))
            .collect();

        let entries: Vec<IndexEntry> = records
            .into_par_iter()
            .map(|record| {
                cancel.checkpoint()?;
                let vector = self.embed(&record.projection())?;
                Ok(IndexEntry {
                    key: record.key(),
                    content_hash: content_hash(&record)?,
                    vector,
                    record: Arc::new(record),
                })
            })
            .collect::<SenseResult<Vec<_>>>()?;
        cancel.checkpoint()?;

        let generation = self
            .snapshot(spreadsheet_id)
            .map(|s| s.generation + 1)
            .unwrap_or(1);
        let mut next = IndexSnapshot::empty(spreadsheet_id, self.embedder.as_ref());
        next.generation = generation;
        for entry in entries {
            let kind = entry.record.kind();
            next.index_mut(kind).upsert(entry);
        }

        info!(
            spreadsheet_id,
            generation,
            structural = next.structural.len(),
            computational = next.computational.len(),
            "index rebuilt"
        );
        Ok(self.publish(next))
    }

    /// Drop a spreadsheet's indices; returns whether one existed
    pub fn discard(&self, spreadsheet_id: &str) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(spreadsheet_id)
            .is_some();
        if removed {
            info!(spreadsheet_id, "index discarded");
        }
        removed
    }

    /// Write a snapshot to disk as JSON
    pub fn save_snapshot(&self, spreadsheet_id: &str, path: &Path) -> SenseResult<()> {
        let snapshot = self.snapshot(spreadsheet_id)?;
        let persist = |index: &FlatIndex| -> Vec<PersistedEntry> {
            index
                .entries()
                .map(|e| PersistedEntry {
                    content_hash: e.content_hash.clone(),
                    vector: e.vector.clone(),
                    record: (*e.record).clone(),
                })
                .collect()
        };
        let persisted = PersistedSnapshot {
            spreadsheet_id: snapshot.spreadsheet_id.clone(),
            generation: snapshot.generation,
            embedder: snapshot.embedder.clone(),
            dimension: snapshot.dimension,
            structural: persist(&snapshot.structural),
            computational: persist(&snapshot.computational),
        };
        fs::write(path, serde_json::to_vec(&persisted)?)?;
        info!(spreadsheet_id, path = %path.display(), "index saved");
        Ok(())
    }

    /// Load a saved snapshot and publish it under its spreadsheet id.
    ///
    /// The snapshot must come from an embedder with the same name and dimension.
    pub fn load_snapshot(&self, path: &Path) -> SenseResult<Arc<IndexSnapshot>> {
        let bytes = fs::read(path)?;
        let persisted: PersistedSnapshot = serde_json::from_slice(&bytes)?;
        if persisted.embedder != self.embedder.name()
            || persisted.dimension != self.embedder.dimension()
        {
            return Err(SenseError::Config(format!(
                "index '{}' was built with embedder {} ({} dimensions), current embedder is {} ({} dimensions)",
                path.display(),
                persisted.embedder,
                persisted.dimension,
                self.embedder.name(),
                self.embedder.dimension()
            )));
        }

        let mut snapshot = IndexSnapshot {
            spreadsheet_id: persisted.spreadsheet_id,
            generation: persisted.generation,
            embedder: persisted.embedder,
            dimension: persisted.dimension,
            structural: FlatIndex::new(),
            computational: FlatIndex::new(),
        };
        for entry in persisted.structural.into_iter().chain(persisted.computational) {
            let kind = entry.record.kind();
            snapshot.index_mut(kind).upsert(IndexEntry {
                key: entry.record.key(),
                content_hash: entry.content_hash,
                vector: entry.vector,
                record: Arc::new(entry.record),
            });
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        info!(spreadsheet_id = %snapshot.spreadsheet_id, records = snapshot.len(), "index loaded");
        Ok(self.publish(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use crate::records::DataType;

    fn store() -> SemanticIndexStore {
        SemanticIndexStore::new(Arc::new(HashingEmbedder::new(256)), RetryPolicy::none())
    }

    fn column(sheet: &str, column: &str) -> StructuralRecord {
        StructuralRecord {
            sheet: sheet.into(),
            column: column.into(),
            column_index: 0,
            address: "A2:A10".into(),
            data_type: DataType::Numeric,
            description: None,
            samples: vec!["1".into()],
        }
    }

    #[test]
    fn test_unknown_spreadsheet_needs_indexing() {
        let store = store();
        let err = store
            .query("nope", IndexKind::Structural, QueryInput::Text("x".into()), 3)
            .unwrap_err();
        assert!(matches!(err, SenseError::IndexUnavailable { .. }));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let record = IndexedRecord::Structural(column("Sales", "Revenue"));
        assert_eq!(store.upsert("wb", record.clone()).unwrap(), UpsertOutcome::Inserted);
        let generation = store.snapshot("wb").unwrap().generation;

        assert_eq!(store.upsert("wb", record).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.snapshot("wb").unwrap().generation, generation);

        let mut changed = column("Sales", "Revenue");
        changed.samples.push("2".into());
        assert_eq!(
            store.upsert("wb", IndexedRecord::Structural(changed)).unwrap(),
            UpsertOutcome::Replaced
        );
    }

    #[test]
    fn test_empty_kind_returns_empty() {
        let store = store();
        store
            .upsert("wb", IndexedRecord::Structural(column("Sales", "Revenue")))
            .unwrap();
        let results = store
            .query("wb", IndexKind::Computational, QueryInput::Text("revenue".into()), 5)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_cancelled_rebuild_keeps_old_snapshot() {
        let store = store();
        let cancel = CancellationToken::new();
        let first = store
            .rebuild("wb", vec![column("Sales", "Revenue")], Vec::new(), &cancel)
            .unwrap();

        cancel.cancel();
        let err = store
            .rebuild("wb", vec![column("Sales", "Units")], Vec::new(), &cancel)
            .unwrap_err();
        assert!(matches!(err, SenseError::Cancelled));

        let current = store.snapshot("wb").unwrap();
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = store();
        store
            .rebuild(
                "wb",
                vec![column("Sales", "Revenue"), column("Sales", "Units")],
                Vec::new(),
                &CancellationToken::new(),
            )
            .unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        store.save_snapshot("wb", file.path()).unwrap();

        let other = self::store();
        let loaded = other.load_snapshot(file.path()).unwrap();
        assert_eq!(loaded.spreadsheet_id, "wb");
        assert_eq!(loaded.structural.len(), 2);

        let top = other
            .query("wb", IndexKind::Structural, QueryInput::Text("units".into()), 1)
            .unwrap();
        assert_eq!(top[0].record.label(), "Units");
    }

    #[test]
    fn test_load_rejects_other_embedder() {
        let store = store();
        store
            .upsert("wb", IndexedRecord::Structural(column("Sales", "Revenue")))
            .unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        store.save_snapshot("wb", file.path()).unwrap();

        let other = SemanticIndexStore::new(Arc::new(HashingEmbedder::new(32)), RetryPolicy::none());
        assert!(matches!(
            other.load_snapshot(file.path()),
            Err(SenseError::Config(_))
        ));
    }

    #[test]
    fn test_discard() {
        let store = store();
        store
            .upsert("wb", IndexedRecord::Structural(column("Sales", "Revenue")))
            .unwrap();
        assert!(store.discard("wb"));
        assert!(!store.discard("wb"));
        assert!(store.snapshot("wb").is_err());
    }
}
