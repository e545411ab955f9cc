//! Formula tokenizer shared by the extractors
//!
//! The lexer only needs enough of the formula grammar to find references,
//! function calls and labelled names, and to print a formula back with
//! canonical spacing. It never evaluates anything.

use crate::reference::{col_to_letter, letters_to_col};
use regex::Regex;
use std::sync::LazyLock;

// Optional sheet prefix: 'Quoted Name'!, [1]Sheet!, or Plain_Name!
const SHEET_PREFIX: &str =
    r"(?:(?P<prefix>'(?:[^']|'')+'|\[[^\]]+\][A-Za-z0-9_.]*|[A-Za-z_][A-Za-z0-9_.]*)!)?";

static CELL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{SHEET_PREFIX}(?P<c1>\$?[A-Za-z]{{1,3}})(?P<r1>\$?[0-9]+)(?::(?P<c2>\$?[A-Za-z]{{1,3}})(?P<r2>\$?[0-9]+))?"
    ))
    .expect("cell reference pattern is valid")
});

static COLUMN_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{SHEET_PREFIX}(?P<c1>\$?[A-Za-z]{{1,3}}):(?P<c2>\$?[A-Za-z]{{1,3}})"
    ))
    .expect("column reference pattern is valid")
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?")
        .expect("number pattern is valid")
});

static ERROR_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?:NULL!|DIV/0!|VALUE!|REF!|NAME\?|NUM!|N/A|GETTING_DATA|SPILL!|CALC!)")
        .expect("error literal pattern is valid")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_\\][A-Za-z0-9_.]*").expect("identifier pattern is valid")
});

/// One end of a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefPoint {
    pub col: u32,
    /// `None` for whole-column references
    pub row: Option<u32>,
    pub col_abs: bool,
    pub row_abs: bool,
}

/// A cell, range or whole-column reference as written in a formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Original text, including any sheet prefix
    pub text: String,
    /// External workbook tag (`1` for `[1]Sheet!A1`, file name for `'[Book.xlsx]Sheet'!A1`)
    pub external: Option<String>,
    pub sheet: Option<String>,
    pub start: RefPoint,
    pub end: Option<RefPoint>,
}

impl Reference {
    pub fn is_whole_column(&self) -> bool {
        self.start.row.is_none()
    }

    /// Normalised bounds: (first_col, last_col, first_row, last_row); rows are `None` for whole columns
    pub fn bounds(&self) -> (u32, u32, Option<u32>, Option<u32>) {
        let end = self.end.unwrap_or(self.start);
        let (c1, c2) = (self.start.col.min(end.col), self.start.col.max(end.col));
        match (self.start.row, end.row) {
            (Some(r1), Some(r2)) => (c1, c2, Some(r1.min(r2)), Some(r1.max(r2))),
            _ => (c1, c2, None, None),
        }
    }

    /// Whether the reference covers the given cell of its target sheet
    pub fn contains(&self, row: u32, col: u32) -> bool {
        let (c1, c2, r1, r2) = self.bounds();
        if col < c1 || col > c2 {
            return false;
        }
        match (r1, r2) {
            (Some(r1), Some(r2)) => row >= r1 && row <= r2,
            _ => true,
        }
    }

    /// Single cell (not a range)
    pub fn single_cell(&self) -> Option<(u32, u32)> {
        match (self.end, self.start.row) {
            (None, Some(row)) => Some((row, self.start.col)),
            _ => None,
        }
    }
}

/// Formula token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(String),
    /// String literal including its quotes
    Text(String),
    ErrorLiteral(String),
    Reference(Reference),
    /// Identifier immediately followed by `(`
    Function(String),
    /// Labelled range, boolean literal or any other bare identifier
    Name(String),
    Operator(String),
    Open,
    Close,
    Separator(char),
    Other(String),
}

/// Tokenize a formula (with or without the leading `=`)
pub fn tokenize(formula: &str) -> Vec<Token> {
    let source = formula.trim();
    let source = source.strip_prefix('=').unwrap_or(source);
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let Some(ch) = rest.chars().next() else {
            break;
        };

        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }

        if ch == '"' {
            let len = string_literal_len(rest);
            tokens.push(Token::Text(rest[..len].to_string()));
            pos += len;
            continue;
        }

        if ch == '#' {
            if let Some(m) = ERROR_LITERAL.find(rest) {
                tokens.push(Token::ErrorLiteral(m.as_str().to_string()));
                pos += m.end();
            } else {
                tokens.push(Token::Other(ch.to_string()));
                pos += ch.len_utf8();
            }
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && rest[1..].starts_with(|c: char| c.is_ascii_digit())) {
            if let Some(m) = NUMBER.find(rest) {
                tokens.push(Token::Number(m.as_str().to_string()));
                pos += m.end();
                continue;
            }
        }

        if ch == '\'' || ch == '[' || ch == '$' || ch == '_' || ch == '\\' || ch.is_ascii_alphabetic() {
            if let Some((reference, len)) = match_reference(rest) {
                tokens.push(Token::Reference(reference));
                pos += len;
                continue;
            }
            if let Some(m) = IDENTIFIER.find(rest) {
                let ident = m.as_str().to_string();
                pos += m.end();
                if source[pos..].trim_start().starts_with('(') {
                    tokens.push(Token::Function(ident));
                } else {
                    tokens.push(Token::Name(ident));
                }
                continue;
            }
            if ch == '\'' {
                // Quoted text that is not a sheet prefix; keep it whole
                let len = rest[1..].find('\'').map(|i| i + 2).unwrap_or(rest.len());
                tokens.push(Token::Other(rest[..len].to_string()));
                pos += len;
                continue;
            }
        }

        match ch {
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            ',' | ';' => tokens.push(Token::Separator(ch)),
            '<' | '>' => {
                let two = rest.get(..2).unwrap_or("");
                if two == "<=" || two == ">=" || two == "<>" {
                    tokens.push(Token::Operator(two.to_string()));
                    pos += 2;
                    continue;
                }
                tokens.push(Token::Operator(ch.to_string()));
            }
            '+' | '-' | '*' | '/' | '^' | '&' | '=' | '%' | ':' => {
                tokens.push(Token::Operator(ch.to_string()))
            }
            _ => tokens.push(Token::Other(ch.to_string())),
        }
        pos += ch.len_utf8();
    }

    tokens
}

fn string_literal_len(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    rest.len()
}

fn match_reference(rest: &str) -> Option<(Reference, usize)> {
    let (caps, is_column) = if let Some(caps) = CELL_REF.captures(rest) {
        (caps, false)
    } else {
        (COLUMN_REF.captures(rest)?, true)
    };
    let whole = caps.get(0)?;
    let len = whole.end();

    // A reference must not run into an identifier or a call (LOG10(, Q1_Sales, A1B)
    if let Some(next) = rest[len..].chars().next() {
        if next.is_ascii_alphanumeric() || next == '_' || next == '.' || next == '(' || next == '!' {
            return None;
        }
    }

    let (external, sheet) = match caps.name("prefix") {
        Some(prefix) => split_prefix(prefix.as_str()),
        None => (None, None),
    };

    let start = parse_point(caps.name("c1")?.as_str(), caps.name("r1").map(|m| m.as_str()))?;
    let end = match caps.name("c2") {
        Some(c2) => Some(parse_point(c2.as_str(), caps.name("r2").map(|m| m.as_str()))?),
        None => None,
    };
    if is_column && end.is_none() {
        return None;
    }

    Some((
        Reference {
            text: whole.as_str().to_string(),
            external,
            sheet,
            start,
            end,
        },
        len,
    ))
}

fn split_prefix(prefix: &str) -> (Option<String>, Option<String>) {
    let unquoted = if prefix.starts_with('\'') && prefix.ends_with('\'') && prefix.len() >= 2 {
        prefix[1..prefix.len() - 1].replace("''", "'")
    } else {
        prefix.to_string()
    };

    if let Some(stripped) = unquoted.strip_prefix('[') {
        if let Some(close) = stripped.find(']') {
            let book = stripped[..close].to_string();
            let sheet = stripped[close + 1..].to_string();
            let sheet = if sheet.is_empty() { None } else { Some(sheet) };
            return (Some(book), sheet);
        }
    }
    (None, Some(unquoted))
}

fn parse_point(col_text: &str, row_text: Option<&str>) -> Option<RefPoint> {
    let col_abs = col_text.starts_with('$');
    let col = letters_to_col(col_text.trim_start_matches('$'))?;
    let (row, row_abs) = match row_text {
        Some(r) => {
            let abs = r.starts_with('$');
            let row = r.trim_start_matches('$').parse::<u32>().ok()?.checked_sub(1)?;
            (Some(row), abs)
        }
        None => (None, false),
    };
    Some(RefPoint {
        col,
        row,
        col_abs,
        row_abs,
    })
}

/// Names of all functions called by the formula, uppercased
pub fn function_names(tokens: &[Token]) -> Vec<String> {
    tokens
        .iter()
        .filter_map(|t| match t {
            Token::Function(name) => Some(name.to_uppercase()),
            _ => None,
        })
        .collect()
}

/// All references of the formula
pub fn references(tokens: &[Token]) -> impl Iterator<Item = &Reference> {
    tokens.iter().filter_map(|t| match t {
        Token::Reference(r) => Some(r),
        _ => None,
    })
}

/// Print tokens back with canonical spacing: `(revenue - cost_of_goods) / revenue`
pub fn render(tokens: &[Token]) -> String {
    render_with(tokens, |reference| reference.text.clone())
}

/// Print tokens, letting the caller choose how each reference is written
pub fn render_with<F>(tokens: &[Token], mut reference_text: F) -> String
where
    F: FnMut(&Reference) -> String,
{
    let mut out = String::new();
    let mut prev: Option<&Token> = None;

    for token in tokens {
        match token {
            Token::Operator(op) if op == ":" || op == "%" => out.push_str(op),
            Token::Operator(op) => {
                let unary = (op == "-" || op == "+")
                    && match prev {
                        None | Some(Token::Open) | Some(Token::Separator(_)) => true,
                        Some(Token::Operator(p)) => p != "%",
                        _ => false,
                    };
                if unary {
                    out.push_str(op);
                } else {
                    out.push(' ');
                    out.push_str(op);
                    out.push(' ');
                }
            }
            Token::Separator(sep) => {
                out.push(*sep);
                out.push(' ');
            }
            Token::Open => out.push('('),
            Token::Close => out.push(')'),
            Token::Reference(reference) => out.push_str(&reference_text(reference)),
            Token::Number(text)
            | Token::Text(text)
            | Token::ErrorLiteral(text)
            | Token::Function(text)
            | Token::Name(text)
            | Token::Other(text) => out.push_str(text),
        }
        prev = Some(token);
    }

    out.trim().to_string()
}

/// Position-independent signature of a formula, used to detect repeated column logic.
///
/// Relative parts of references become offsets from the anchor cell (R[-1]C[0]);
/// `$`-anchored parts stay absolute.
pub fn relative_signature(tokens: &[Token], anchor_row: u32, anchor_col: u32) -> String {
    render_with(tokens, |r| {
        let mut text = String::new();
        if let Some(book) = &r.external {
            text.push_str(&format!("[{}]", book));
        }
        if let Some(sheet) = &r.sheet {
            text.push_str(sheet);
            text.push('!');
        }
        text.push_str(&relative_point(&r.start, anchor_row, anchor_col));
        if let Some(end) = &r.end {
            text.push(':');
            text.push_str(&relative_point(end, anchor_row, anchor_col));
        }
        text
    })
}

fn relative_point(point: &RefPoint, anchor_row: u32, anchor_col: u32) -> String {
    let row = match point.row {
        None => String::new(),
        Some(row) if point.row_abs => format!("R{}", row + 1),
        Some(row) => format!("R[{}]", row as i64 - anchor_row as i64),
    };
    let col = if point.col_abs {
        format!("C{}", point.col + 1)
    } else {
        format!("C[{}]", point.col as i64 - anchor_col as i64)
    };
    format!("{}{}", row, col)
}

/// Human-readable parameterised pattern: `=(A{row} - B{row}) / A{row}`
pub fn row_pattern(tokens: &[Token], anchor_row: u32) -> String {
    let body = render_with(tokens, |r| {
        let mut text = String::new();
        if let Some(book) = &r.external {
            text.push_str(&format!("[{}]", book));
        }
        if let Some(sheet) = &r.sheet {
            text.push_str(&quote_sheet(sheet));
            text.push('!');
        }
        text.push_str(&pattern_point(&r.start, anchor_row));
        if let Some(end) = &r.end {
            text.push(':');
            text.push_str(&pattern_point(end, anchor_row));
        }
        text
    });
    format!("={}", body)
}

fn pattern_point(point: &RefPoint, anchor_row: u32) -> String {
    let col = format!(
        "{}{}",
        if point.col_abs { "$" } else { "" },
        col_to_letter(point.col)
    );
    match point.row {
        None => col,
        Some(row) if point.row_abs => format!("{}${}", col, row + 1),
        Some(row) => {
            let offset = row as i64 - anchor_row as i64;
            match offset {
                0 => format!("{}{{row}}", col),
                o if o > 0 => format!("{}{{row+{}}}", col, o),
                o => format!("{}{{row{}}}", col, o),
            }
        }
    }
}

/// Quote a sheet name when it needs quoting in a formula
pub fn quote_sheet(sheet: &str) -> String {
    let plain = sheet
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && sheet.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if plain {
        sheet.to_string()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}
