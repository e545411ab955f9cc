//! Query rewrites for refinement iterations

use crate::embed::terms;
use crate::records::IndexedRecord;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Small business-vocabulary thesaurus; each group is mutually synonymous
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["revenue", "sales", "turnover", "income"],
    &["cost", "expense", "spend", "cogs"],
    &["margin", "profit", "earnings"],
    &["price", "rate", "tariff"],
    &["quantity", "qty", "units", "volume"],
    &["total", "sum", "aggregate"],
    &["customer", "client", "account"],
    &["date", "period", "month"],
    &["employee", "staff", "headcount"],
    &["growth", "change", "increase"],
    &["tax", "vat", "duty"],
    &["discount", "rebate"],
];

static SYNONYMS: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    let mut map: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
    for group in SYNONYM_GROUPS {
        for word in group.iter() {
            map.entry(*word)
                .or_default()
                .extend(group.iter().filter(|w| *w != word));
        }
    }
    map
});

fn push_unique(out: &mut Vec<String>, word: String) {
    if !out.contains(&word) {
        out.push(word);
    }
}

fn keywords(query: &str, focus_terms: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let source = if focus_terms.is_empty() {
        terms(query)
    } else {
        focus_terms.iter().flat_map(|t| terms(t)).collect()
    };
    for word in source {
        push_unique(&mut out, word);
    }
    out
}

/// Keywords followed by their synonyms
pub fn broaden(query: &str, focus_terms: &[String]) -> String {
    let mut out = keywords(query, focus_terms);
    let base = out.clone();
    for word in &base {
        if let Some(synonyms) = SYNONYMS.get(word.as_str()) {
            for synonym in synonyms {
                push_unique(&mut out, synonym.to_string());
            }
        }
    }
    out.join(" ")
}

/// Keywords followed by vocabulary surfaced from already retrieved records:
/// their labels and, for measures, the identifiers they read from
pub fn enrich<'a, I>(query: &str, focus_terms: &[String], retrieved: I) -> String
where
    I: IntoIterator<Item = &'a IndexedRecord>,
{
    let mut out = keywords(query, focus_terms);
    for record in retrieved {
        for word in terms(record.label()) {
            push_unique(&mut out, word);
        }
        if let Some(measure) = record.as_measure() {
            for dependency in &measure.depends_on {
                let local = dependency.rsplit('.').next().unwrap_or(dependency);
                for word in terms(local) {
                    push_unique(&mut out, word);
                }
            }
        }
    }
    out.join(" ")
}

/// Query text for a given 1-based iteration
pub fn reformulate<'a, I>(iteration: usize, query: &str, focus_terms: &[String], retrieved: I) -> String
where
    I: IntoIterator<Item = &'a IndexedRecord>,
{
    match iteration {
        0 | 1 => query.to_string(),
        2 => broaden(query, focus_terms),
        _ => enrich(query, focus_terms, retrieved),
    }
}
