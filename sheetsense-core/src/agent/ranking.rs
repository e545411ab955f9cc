//! Final ordering: similarity plus contextual-fit boosts

use crate::config::RankingConfig;
use crate::records::IndexedRecord;
use crate::source::LiveValue;
use std::sync::Arc;

/// A record collected during refinement, with its best similarity so far
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: Arc<IndexedRecord>,
    pub similarity: f32,
    pub verified: Option<LiveValue>,
}

impl Candidate {
    pub fn new(record: Arc<IndexedRecord>, similarity: f32) -> Self {
        Self {
            record,
            similarity,
            verified: None,
        }
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn contains_phrase(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

/// The query names the column or measure, word for word
pub fn name_matches(query: &str, record: &IndexedRecord) -> bool {
    contains_phrase(&words(query), &words(record.label()))
}

/// The query names the record's sheet
pub fn sheet_matches(query: &str, record: &IndexedRecord) -> bool {
    contains_phrase(&words(query), &words(record.sheet()))
}

pub fn contextual_score(query: &str, candidate: &Candidate, weights: &RankingConfig) -> f32 {
    let mut score = candidate.similarity;
    if name_matches(query, &candidate.record) {
        score += weights.exact_name_boost;
    }
    if sheet_matches(query, &candidate.record) {
        score += weights.sheet_match_boost;
    }
    if candidate.verified.is_some() {
        score += weights.verified_boost;
    }
    score
}

/// Order candidates by contextual score and keep the best `limit`
pub fn rank(
    query: &str,
    candidates: Vec<Candidate>,
    weights: &RankingConfig,
    limit: usize,
) -> Vec<(Candidate, f32)> {
    let mut scored: Vec<(Candidate, f32)> = candidates
        .into_iter()
        .map(|c| {
            let score = contextual_score(query, &c, weights);
            (c, score)
        })
        .collect();
    scored.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| b.similarity.total_cmp(&a.similarity))
            .then_with(|| a.record.key().cmp(&b.record.key()))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CellValue;
    use crate::records::{DataType, StructuralRecord};

    fn column(sheet: &str, name: &str) -> Arc<IndexedRecord> {
        Arc::new(IndexedRecord::Structural(StructuralRecord {
            sheet: sheet.into(),
            column: name.into(),
            column_index: 0,
            address: "A2:A9".into(),
            data_type: DataType::Numeric,
            description: None,
            samples: Vec::new(),
        }))
    }

    #[test]
    fn test_boosts() {
        let weights = RankingConfig::default();
        let query = "What is the unit price on the Orders sheet?";
        let plain = Candidate::new(column("Stock", "Weight"), 0.5);
        let named = Candidate::new(column("Stock", "Unit Price"), 0.5);
        let both = Candidate::new(column("Orders", "Unit Price"), 0.5);
        let mut verified = Candidate::new(column("Stock", "Weight"), 0.5);
        verified.verified = Some(LiveValue {
            sheet: "Stock".into(),
            address: "A9".into(),
            value: CellValue::Number(3.0),
            formula: None,
        });

        assert_eq!(contextual_score(query, &plain, &weights), 0.5);
        assert!((contextual_score(query, &named, &weights) - 0.65).abs() < 1e-6);
        assert!((contextual_score(query, &both, &weights) - 0.70).abs() < 1e-6);
        assert!((contextual_score(query, &verified, &weights) - 0.60).abs() < 1e-6);
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let weights = RankingConfig::default();
        let ranked = rank(
            "price",
            vec![
                Candidate::new(column("S", "Cost"), 0.7),
                Candidate::new(column("S", "Price"), 0.6),
                Candidate::new(column("S", "Margin"), 0.1),
            ],
            &weights,
            2,
        );
        let labels: Vec<&str> = ranked.iter().map(|(c, _)| c.record.label()).collect();
        assert_eq!(labels, vec!["Price", "Cost"]);
    }

    #[test]
    fn test_partial_name_is_not_exact() {
        assert!(!name_matches("unit cost", &column("S", "Unit Price")));
        assert!(name_matches("UNIT-PRICE trend", &column("S", "Unit Price")));
    }
}
