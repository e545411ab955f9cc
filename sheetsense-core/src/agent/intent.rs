//! Query analysis that does not need the reasoning service

use crate::embed::terms;
use crate::reference::CellReference;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static CELL_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:'(?P<quoted>[^']+)'|(?P<plain>[A-Za-z_][A-Za-z0-9_.]*))!(?P<cell>\$?[A-Za-z]{1,3}\$?[0-9]+)")
        .expect("cell mention pattern is valid")
});

static ROW_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\brow\s+(?P<row>[0-9]+)\s+(?:of|in|on)\s+(?:the\s+)?(?:'(?P<quoted>[^']+)'|(?P<plain>[A-Za-z_][A-Za-z0-9_.]*))",
    )
    .expect("row mention pattern is valid")
});

static BARE_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{1,3}[0-9]+$").expect("bare cell pattern is valid"));

static QUOTED_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("quoted term pattern is valid"));

/// An explicit cell or row the query points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mention {
    Cell { sheet: String, address: String },
    /// 1-based row
    Row { sheet: String, row: u32 },
}

fn sheet_name(caps: &regex::Captures<'_>) -> Option<String> {
    caps.name("quoted")
        .or_else(|| caps.name("plain"))
        .map(|m| m.as_str().to_string())
}

/// `Sheet!B5`, `'Income Statement'!C2` and "row 7 of Sales" mentions, in order
pub fn mentions(query: &str) -> Vec<Mention> {
    let mut found: Vec<(usize, Mention)> = Vec::new();

    for caps in CELL_MENTION.captures_iter(query) {
        let (Some(sheet), Some(cell)) = (sheet_name(&caps), caps.name("cell")) else {
            continue;
        };
        if let Some(reference) = CellReference::parse_a1(cell.as_str()) {
            found.push((
                caps.get(0).map_or(0, |m| m.start()),
                Mention::Cell {
                    sheet,
                    address: reference.to_excel_ref(),
                },
            ));
        }
    }

    for caps in ROW_MENTION.captures_iter(query) {
        let row = caps
            .name("row")
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .filter(|row| *row > 0);
        if let (Some(row), Some(sheet)) = (row, sheet_name(&caps)) {
            found.push((caps.get(0).map_or(0, |m| m.start()), Mention::Row { sheet, row }));
        }
    }

    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, mention)| mention).collect()
}

/// Uppercase tokens such as `EBITDA` or `P&L`; bare cell addresses like `AB12` are not acronyms
fn is_acronym(word: &str) -> bool {
    !BARE_CELL.is_match(word)
        && word.chars().filter(|c| c.is_ascii_uppercase()).count() >= 2
        && word
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '&')
}

/// Business terms the index has never seen: acronyms and quoted phrases
/// whose words are missing from the vocabulary
pub fn unknown_terms(query: &str, vocabulary: &BTreeSet<String>) -> Vec<String> {
    let mut candidates: Vec<String> = QUOTED_TERM
        .captures_iter(query)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect();

    let without_mentions = CELL_MENTION.replace_all(query, " ");
    candidates.extend(
        without_mentions
            .split(|c: char| !(c.is_alphanumeric() || c == '&'))
            .filter(|w| is_acronym(w))
            .map(str::to_string),
    );

    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|term| {
            let words = terms(term);
            !words.is_empty() && words.iter().any(|w| !vocabulary.contains(w))
        })
        .filter(|term| seen.insert(term.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_and_row_mentions() {
        let found = mentions("Is Income!$d4 right, and what is in row 3 of 'Cost Centers'?");
        assert_eq!(
            found,
            vec![
                Mention::Cell {
                    sheet: "Income".into(),
                    address: "D4".into()
                },
                Mention::Row {
                    sheet: "Cost Centers".into(),
                    row: 3
                },
            ]
        );
        assert!(mentions("How is gross margin calculated?").is_empty());
        assert!(mentions("row 0 of Sales").is_empty());
    }

    #[test]
    fn test_unknown_terms() {
        let vocabulary: BTreeSet<String> = ["gross", "margin", "revenue", "cogs"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            unknown_terms("How is EBITDA related to gross margin?", &vocabulary),
            vec!["EBITDA"]
        );
        assert!(unknown_terms("Where is COGS used?", &vocabulary).is_empty());
        assert_eq!(
            unknown_terms("What feeds \"churn rate\"?", &vocabulary),
            vec!["churn rate"]
        );
        // Cell addresses are not acronyms, qualified or bare
        assert!(unknown_terms("What is in Income!AB12?", &vocabulary).is_empty());
        assert!(unknown_terms("What is in AB12 and $C$7?", &vocabulary).is_empty());
        assert_eq!(unknown_terms("Is P&L in AB12?", &vocabulary), vec!["P&L"]);
    }
}
