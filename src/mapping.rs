// 🔗 Column Mapper - Tolerant header matching
// Folds uploaded column names to comparable tokens and greedily pairs them
// with the columns a schema expects.
//
// Scores: 100 exact normalized match, 90 declared synonym, 70 substring, 0 none.
// Assignment is greedy (highest score first, shorter actual name on ties),
// not an optimal bipartite matching. Schemas are small and a wrong guess is
// cheap to override by hand.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::schema::{InputSchema, Synonyms};

pub const SCORE_EXACT: u8 = 100;
pub const SCORE_SYNONYM: u8 = 90;
pub const SCORE_SUBSTRING: u8 = 70;

const SEPARATORS: &[char] = &['-', '.', '_', '/', '\\'];
const ID_SUFFIXES: &[&str] = &["number", "num", "no", "id"];

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Canonical token for a column name.
///
/// "Fatura No", "invoice_number" and "InvoiceID" all lose their id/number
/// suffix so they compare on the meaningful stem.
pub fn normalize(name: &str) -> String {
    let mut text: String = name
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(transliterate)
        .filter(|c| !c.is_whitespace() && !SEPARATORS.contains(c))
        .collect();

    text = text.replace("idno", "id");

    for suffix in ID_SUFFIXES {
        if text.ends_with(suffix) && text.len() > suffix.len() + 2 {
            text.truncate(text.len() - suffix.len());
        }
    }

    text
}

fn transliterate(c: char) -> Option<char> {
    match c {
        'ı' | 'İ' => Some('i'),
        'ç' => Some('c'),
        'ş' => Some('s'),
        'ö' => Some('o'),
        'ü' => Some('u'),
        'ğ' => Some('g'),
        // lower-casing 'İ' leaves a combining dot above behind
        '\u{0307}' => None,
        other => Some(other),
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Normalized synonym sets keyed by expected column.
fn normalized_synonyms(synonyms: &Synonyms) -> BTreeMap<&str, HashSet<String>> {
    synonyms
        .iter()
        .map(|(expected, alternatives)| {
            let mut set: HashSet<String> = alternatives.iter().map(|a| normalize(a)).collect();
            set.insert(normalize(expected));
            (expected.as_str(), set)
        })
        .collect()
}

fn score_normalized(expected_norm: &str, actual_norm: &str, synonyms: Option<&HashSet<String>>) -> u8 {
    if expected_norm.is_empty() || actual_norm.is_empty() {
        return 0;
    }
    if actual_norm == expected_norm {
        SCORE_EXACT
    } else if synonyms.is_some_and(|set| set.contains(actual_norm)) {
        SCORE_SYNONYM
    } else if actual_norm.contains(expected_norm) || expected_norm.contains(actual_norm) {
        SCORE_SUBSTRING
    } else {
        0
    }
}

/// Score one (expected, actual) pair.
pub fn score_match(expected: &str, actual: &str, synonyms: &Synonyms) -> u8 {
    let table = normalized_synonyms(synonyms);
    score_normalized(&normalize(expected), &normalize(actual), table.get(expected))
}

// ============================================================================
// AUTO MAPPING
// ============================================================================

/// Result of [`auto_map`]: the proposed mapping plus the score of each claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMapping {
    /// expected column -> chosen actual column (None = left for manual resolution)
    pub mapping: BTreeMap<String, Option<String>>,
    pub scores: BTreeMap<String, u8>,
}

impl AutoMapping {
    /// Expected columns that received no actual column.
    pub fn unmapped(&self) -> Vec<&str> {
        self.mapping
            .iter()
            .filter(|(_, actual)| actual.is_none())
            .map(|(expected, _)| expected.as_str())
            .collect()
    }

    /// Required columns of `schema` that are still unmapped.
    pub fn missing_required(&self, schema: &InputSchema) -> Vec<&'static str> {
        schema
            .required
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !matches!(self.mapping.get(*name), Some(Some(_))))
            .collect()
    }

    pub fn into_mapping(self) -> ColumnMapping {
        ColumnMapping::from_pairs(
            self.mapping
                .into_iter()
                .filter_map(|(expected, actual)| actual.map(|a| (expected, a))),
        )
    }
}

/// Greedy score-then-claim assignment.
///
/// Each actual column is claimed by at most one expected column and each
/// expected column receives at most one actual column.
pub fn auto_map(expected: &[&str], actual: &[String], synonyms: &Synonyms) -> AutoMapping {
    let synonym_sets = normalized_synonyms(synonyms);
    let actual_norm: Vec<(&str, String)> = actual
        .iter()
        .map(|col| (col.as_str(), normalize(col)))
        .collect();

    let mut candidates: Vec<(u8, &str, &str)> = Vec::new();
    for exp in expected {
        let exp_norm = normalize(exp);
        let exp_synonyms = synonym_sets.get(exp);
        for (actual_col, actual_value) in &actual_norm {
            let score = score_normalized(&exp_norm, actual_value, exp_synonyms);
            if score > 0 {
                candidates.push((score, *exp, *actual_col));
            }
        }
    }

    // Stable sort keeps (expected, actual) input order among equal keys
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.len().cmp(&b.2.len())));

    let mut mapping: BTreeMap<String, Option<String>> =
        expected.iter().map(|e| (e.to_string(), None)).collect();
    let mut scores = BTreeMap::new();
    let mut used: BTreeSet<&str> = BTreeSet::new();

    for (score, exp, actual_col) in candidates {
        let slot = mapping.entry(exp.to_string()).or_insert(None);
        if slot.is_none() && !used.contains(actual_col) {
            *slot = Some(actual_col.to_string());
            scores.insert(exp.to_string(), score);
            used.insert(actual_col);
        }
    }

    AutoMapping { mapping, scores }
}

// ============================================================================
// COLUMN MAPPING
// ============================================================================

/// expected column -> uploaded column. Unlisted columns are looked up literally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, String>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut mapping = ColumnMapping::new();
        for (expected, actual) in pairs {
            mapping.insert(expected, actual);
        }
        mapping
    }

    /// Blank actual names are ignored, the literal column is used instead.
    pub fn insert(&mut self, expected: impl Into<String>, actual: impl Into<String>) {
        let actual = actual.into();
        if !actual.trim().is_empty() {
            self.0.insert(expected.into(), actual);
        }
    }

    /// Actual column name to read for `expected`.
    pub fn resolve<'a>(&'a self, expected: &'a str) -> &'a str {
        self.0.get(expected).map(String::as_str).unwrap_or(expected)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Presence check against a header: every required column missing after
/// mapping, reported by expected name. Exhaustive, not fail-fast.
pub fn missing_required_columns(
    headers: &[String],
    schema: &InputSchema,
    mapping: &ColumnMapping,
) -> Vec<String> {
    let available: HashSet<&str> = headers.iter().map(String::as_str).collect();
    schema
        .required
        .iter()
        .filter(|(name, _)| !available.contains(mapping.resolve(name)))
        .map(|(name, _)| name.to_string())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableKind;
    use pretty_assertions::assert_eq;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_normalize_strips_suffixes_and_separators() {
        assert_eq!(normalize("Fatura No"), "fatura");
        assert_eq!(normalize("invoice_number"), "invoice");
        assert_eq!(normalize("InvoiceID"), "invoice");
        assert_eq!(normalize("ticket_id"), "ticket");
        // too short to strip
        assert_eq!(normalize("ID"), "id");
        assert_eq!(normalize("Order-No"), "order");
    }

    #[test]
    fn test_normalize_transliterates() {
        assert_eq!(normalize("Tedarikçi"), "tedarikci");
        assert_eq!(normalize("İrsaliye No"), "irsaliye");
        assert_eq!(normalize("KDV Tutarı"), "kdvtutari");
        assert_eq!(normalize("Sipariş Toplamı"), "siparistoplami");
    }

    #[test]
    fn test_score_levels() {
        let synonyms = TableKind::Invoices.synonyms();
        assert_eq!(score_match("invoice_id", "Invoice ID", &synonyms), SCORE_EXACT);
        assert_eq!(score_match("invoice_id", "Fatura No", &synonyms), SCORE_SYNONYM);
        assert_eq!(score_match("vendor", "Vendor Name", &synonyms), SCORE_SUBSTRING);
        assert_eq!(score_match("vendor", "Amount", &synonyms), 0);
    }

    #[test]
    fn test_auto_mapping_synonyms() {
        let expected = ["ticket_id", "created_at", "channel", "customer_text"];
        let actual = strings(&["ID", "Date", "Source", "Message"]);
        let result = auto_map(&expected, &actual, &TableKind::Tickets.synonyms());

        assert_eq!(result.mapping["ticket_id"], Some("ID".to_string()));
        assert_eq!(result.mapping["created_at"], Some("Date".to_string()));
        assert_eq!(result.mapping["channel"], Some("Source".to_string()));
        assert_eq!(result.mapping["customer_text"], Some("Message".to_string()));
        assert!(expected.iter().all(|e| result.scores.contains_key(*e)));
        assert!(result.unmapped().is_empty());
    }

    #[test]
    fn test_auto_mapping_claims_each_actual_once() {
        // "Total" also scores as a substring of subtotal; only one column may take it

        let expected = ["total", "subtotal"];
        let actual = strings(&["Total"]);
        let result = auto_map(&expected, &actual, &TableKind::Invoices.synonyms());

        assert_eq!(result.mapping["total"], Some("Total".to_string()));
        assert_eq!(result.mapping["subtotal"], None);
        assert_eq!(result.unmapped(), vec!["subtotal"]);
    }

    #[test]
    fn test_auto_mapping_prefers_shorter_on_tie() {
        let synonyms = Synonyms::new();
        let expected = ["vendor"];
        let actual = strings(&["vendor_name_full", "vendor_nm"]);
        let result = auto_map(&expected, &actual, &synonyms);

        assert_eq!(result.mapping["vendor"], Some("vendor_nm".to_string()));
        assert_eq!(result.scores["vendor"], SCORE_SUBSTRING);
    }

    #[test]
    fn test_auto_mapping_is_idempotent() {
        let expected = TableKind::Invoices.schema().column_names();
        let actual = strings(&[
            "Fatura No", "Tedarikçi", "Tarih", "Net", "KDV Oranı", "KDV Tutarı", "Toplam",
            "Sipariş No", "İrsaliye No",
        ]);
        let synonyms = TableKind::Invoices.synonyms();

        let first = auto_map(&expected, &actual, &synonyms);
        let second = auto_map(&expected, &actual, &synonyms);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_required_reported_exhaustively() {
        let headers = strings(&["ticket_id", "customer_text"]);
        let missing = missing_required_columns(
            &headers,
            TableKind::Tickets.schema(),
            &ColumnMapping::new(),
        );
        assert_eq!(missing, vec!["created_at".to_string(), "channel".to_string()]);
    }

    #[test]
    fn test_mapping_resolves_renamed_columns() {
        let mapping = ColumnMapping::from_pairs([("ticket_id", "TicketID"), ("channel", " ")]);
        assert_eq!(mapping.resolve("ticket_id"), "TicketID");
        // blank entries fall back to the literal name
        assert_eq!(mapping.resolve("channel"), "channel");
    }
}
