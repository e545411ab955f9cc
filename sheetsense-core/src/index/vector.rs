//! Exact nearest-neighbour index over unit vectors

use crate::embed::cosine_similarity;
use crate::records::{IndexedRecord, RetrievalResult};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// What an upsert did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Same content hash as the stored entry; nothing touched
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub record: Arc<IndexedRecord>,
}

/// Flat index: entries keep their insertion position, which breaks score ties
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.positions.get(key).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Insert a new entry, or replace an existing key in place
    pub fn upsert(&mut self, entry: IndexEntry) -> UpsertOutcome {
        match self.positions.get(&entry.key) {
            Some(&i) if self.entries[i].content_hash == entry.content_hash => {
                UpsertOutcome::Unchanged
            }
            Some(&i) => {
                self.entries[i] = entry;
                UpsertOutcome::Replaced
            }
            None => {
                self.positions.insert(entry.key.clone(), self.entries.len());
                self.entries.push(entry);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Top `k` entries by cosine similarity, ties broken by insertion position
    pub fn search(&self, query: &[f32], k: usize) -> Vec<RetrievalResult> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, cosine_similarity(query, &entry.vector)))
            .collect();

        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        scored
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, (i, score))| RetrievalResult {
                record: Arc::clone(&self.entries[i].record),
                score,
                rank: rank + 1,
            })
            .collect()
    }
}
