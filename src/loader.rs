// 📥 Table Loader - Schema-bound CSV reads
// Presence check -> projection -> rename -> coerce, optionally in row windows.
//
// Windowed reads only change how many records are held at once. Violations are
// collected across windows and raised after the last one, so a windowed load and
// a whole-file load of the same input return the same table or the same error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use csv::{ReaderBuilder, StringRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::LoadLimits;
use crate::error::{LoadError, SchemaError, TypeViolation};
use crate::mapping::{missing_required_columns, ColumnMapping};
use crate::schema::{InputSchema, SemanticType, TableKind};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y", "%d/%m/%Y"];

// ============================================================================
// CELLS & TABLES
// ============================================================================

/// One coerced value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
}

static EMPTY_CELL: Cell = Cell::Empty;

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Text(text) => f.write_str(text),
            Cell::Number(value) => write!(f, "{}", value),
            Cell::Date(value) if value.num_seconds_from_midnight() == 0 => {
                write!(f, "{}", value.format("%Y-%m-%d"))
            }
            Cell::Date(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// Rectangular, schema-conformant data: columns are the schema's required
/// columns plus the optional ones present in the file, under their expected names.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTable {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl LoadedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(move |cells| RowView { table: self, cells })
    }

    /// Convert every row into its typed struct.
    pub fn typed<R: SchemaRow>(&self) -> Vec<R> {
        self.iter_rows().map(|row| R::from_row(&row)).collect()
    }

    /// Overwrite one cell. Returns false when the column is not part of the table.
    pub fn set(&mut self, row: usize, column: &str, value: Cell) -> bool {
        match (self.column_index(column), self.rows.get_mut(row)) {
            (Some(col), Some(cells)) => {
                cells[col] = value;
                true
            }
            _ => false,
        }
    }
}

/// Borrowed view of one row with typed accessors.
pub struct RowView<'a> {
    table: &'a LoadedTable,
    cells: &'a [Cell],
}

impl<'a> RowView<'a> {
    /// Unknown columns read as empty.
    pub fn cell(&self, column: &str) -> &'a Cell {
        self.table
            .column_index(column)
            .and_then(|index| self.cells.get(index))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        match self.cell(column) {
            Cell::Empty => None,
            other => Some(other.to_string()),
        }
    }

    /// Empty text for missing values.
    pub fn text_or_default(&self, column: &str) -> String {
        self.text(column).unwrap_or_default()
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        match self.cell(column) {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDateTime> {
        match self.cell(column) {
            Cell::Date(value) => Some(*value),
            _ => None,
        }
    }
}

// ============================================================================
// TYPED ROWS
// ============================================================================

/// A strongly-typed row for one schema.
pub trait SchemaRow: Sized {
    const TABLE: TableKind;

    fn from_row(row: &RowView<'_>) -> Self;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketRow {
    pub ticket_id: String,
    pub created_at: Option<NaiveDateTime>,
    pub channel: String,
    pub customer_text: String,
    pub category: Option<String>,
    pub order_id: Option<String>,
    pub amount: Option<f64>,
}

impl SchemaRow for TicketRow {
    const TABLE: TableKind = TableKind::Tickets;

    fn from_row(row: &RowView<'_>) -> Self {
        TicketRow {
            ticket_id: row.text_or_default("ticket_id"),
            created_at: row.date("created_at"),
            channel: row.text_or_default("channel"),
            customer_text: row.text_or_default("customer_text"),
            category: row.text("category").filter(|c| !c.trim().is_empty()),
            order_id: row.text("order_id").filter(|o| !o.trim().is_empty()),
            amount: row.number("amount"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRow {
    pub invoice_id: String,
    pub vendor: String,
    pub date: Option<NaiveDateTime>,
    pub subtotal: Option<f64>,
    pub vat_rate: Option<f64>,
    pub vat_amount: Option<f64>,
    pub total: Option<f64>,
    pub po_id: String,
    pub dn_id: String,
}

impl SchemaRow for InvoiceRow {
    const TABLE: TableKind = TableKind::Invoices;

    fn from_row(row: &RowView<'_>) -> Self {
        InvoiceRow {
            invoice_id: row.text_or_default("invoice_id"),
            vendor: row.text_or_default("vendor"),
            date: row.date("date"),
            subtotal: row.number("subtotal"),
            vat_rate: row.number("vat_rate"),
            vat_amount: row.number("vat_amount"),
            total: row.number("total"),
            po_id: row.text_or_default("po_id"),
            dn_id: row.text_or_default("dn_id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOrderRow {
    pub po_id: String,
    pub item_count: Option<f64>,
    pub total_expected: Option<f64>,
}

impl SchemaRow for PurchaseOrderRow {
    const TABLE: TableKind = TableKind::PurchaseOrders;

    fn from_row(row: &RowView<'_>) -> Self {
        PurchaseOrderRow {
            po_id: row.text_or_default("po_id"),
            item_count: row.number("item_count"),
            total_expected: row.number("total_expected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryNoteRow {
    pub dn_id: String,
    pub delivered_item_count: Option<f64>,
}

impl SchemaRow for DeliveryNoteRow {
    const TABLE: TableKind = TableKind::DeliveryNotes;

    fn from_row(row: &RowView<'_>) -> Self {
        DeliveryNoteRow {
            dn_id: row.text_or_default("dn_id"),
            delivered_item_count: row.number("delivered_item_count"),
        }
    }
}

// ============================================================================
// COERCION
// ============================================================================

/// Parse a date in any of the accepted layouts.
pub fn parse_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Finite float, surrounding whitespace allowed.
pub fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Ok(Empty) for blanks, Err(()) when a non-empty value does not fit the type.
fn coerce(raw: &str, expected: SemanticType) -> Result<Cell, ()> {
    if raw.trim().is_empty() {
        return Ok(Cell::Empty);
    }
    match expected {
        SemanticType::String => Ok(Cell::Text(raw.to_string())),
        SemanticType::Number => parse_number(raw).map(Cell::Number).ok_or(()),
        SemanticType::Date => parse_date(raw).map(Cell::Date).ok_or(()),
    }
}

/// Which file column feeds which expected column.
struct Projection {
    /// (expected name, type, index in file header)
    columns: Vec<(&'static str, SemanticType, usize)>,
}

impl Projection {
    fn resolve(headers: &[String], schema: &InputSchema, mapping: &ColumnMapping) -> Self {
        let columns = schema
            .all_columns()
            .filter_map(|(name, ty)| {
                let actual = mapping.resolve(name);
                headers
                    .iter()
                    .position(|h| h == actual)
                    .map(|index| (name, ty, index))
            })
            .collect();
        Projection { columns }
    }

    fn names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _, _)| name.to_string()).collect()
    }

    fn coerce_record(
        &self,
        record: &StringRecord,
        row_number: usize,
        violations: &mut BTreeMap<usize, TypeViolation>,
    ) -> Vec<Cell> {
        self.columns
            .iter()
            .enumerate()
            .map(|(position, (name, ty, index))| {
                let raw = record.get(*index).unwrap_or("");
                coerce(raw, *ty).unwrap_or_else(|()| {
                    violations.entry(position).or_insert_with(|| TypeViolation {
                        column: name.to_string(),
                        expected: *ty,
                        first_row: row_number,
                        first_value: raw.to_string(),
                    });
                    Cell::Empty
                })
            })
            .collect()
    }
}

// ============================================================================
// WINDOWED READER
// ============================================================================

/// CSV reader that hands out records in bounded windows, honoring the row cap.
struct WindowedRecords {
    reader: csv::Reader<File>,
    path: PathBuf,
    headers: Vec<String>,
    limits: LoadLimits,
    consumed: usize,
    exhausted: bool,
}

impl WindowedRecords {
    fn open(path: &Path, limits: LoadLimits) -> Result<Self, LoadError> {
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers = reader
            .headers()
            .map_err(|source| LoadError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect();

        Ok(WindowedRecords {
            reader,
            path: path.to_path_buf(),
            headers,
            limits,
            consumed: 0,
            exhausted: false,
        })
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_window(&mut self) -> Result<Option<Vec<StringRecord>>, LoadError> {
        if self.exhausted {
            return Ok(None);
        }

        let remaining = self
            .limits
            .max_rows
            .map(|cap| cap.saturating_sub(self.consumed))
            .unwrap_or(usize::MAX);
        let window = self.limits.window_size.unwrap_or(usize::MAX).min(remaining);
        if window == 0 {
            self.exhausted = true;
            return Ok(None);
        }

        let mut records = Vec::new();
        let mut record = StringRecord::new();
        while records.len() < window {
            let more = self
                .reader
                .read_record(&mut record)
                .map_err(|source| LoadError::Csv {
                    path: self.path.clone(),
                    source,
                })?;
            if !more {
                self.exhausted = true;
                break;
            }
            records.push(record.clone());
        }

        self.consumed += records.len();
        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(records))
        }
    }
}

/// Header row of a CSV file, BOM and surrounding whitespace removed.
pub fn read_headers(path: &Path) -> Result<Vec<String>, LoadError> {
    WindowedRecords::open(path, LoadLimits::unlimited()).map(|source| source.headers)
}

// ============================================================================
// LOAD
// ============================================================================

/// Load `path` under `schema` and `mapping`.
///
/// Fails with every missing required column before reading a single row, and
/// with every badly typed column after reading all of them.
pub fn load(
    path: &Path,
    schema: &InputSchema,
    mapping: &ColumnMapping,
    limits: LoadLimits,
) -> Result<LoadedTable, LoadError> {
    let mut source = WindowedRecords::open(path, limits)?;

    let missing = missing_required_columns(source.headers(), schema, mapping);
    if !missing.is_empty() {
        return Err(SchemaError::MissingColumns {
            table: schema.table.to_string(),
            columns: missing,
        }
        .into());
    }

    let projection = Projection::resolve(source.headers(), schema, mapping);
    let mut rows = Vec::new();
    let mut violations = BTreeMap::new();
    let mut windows = 0usize;

    while let Some(window) = source.next_window()? {
        windows += 1;
        for record in &window {
            let row_number = rows.len() + 1;
            rows.push(projection.coerce_record(record, row_number, &mut violations));
        }
    }

    if !violations.is_empty() {
        return Err(SchemaError::InvalidTypes {
            table: schema.table.to_string(),
            violations: violations.into_values().collect(),
        }
        .into());
    }

    tracing::debug!(
        table = schema.table,
        rows = rows.len(),
        windows,
        "loaded {}",
        path.display()
    );

    Ok(LoadedTable {
        table: schema.table.to_string(),
        columns: projection.names(),
        rows,
    })
}

/// Load and convert to typed rows in one go.
pub fn load_typed<R: SchemaRow>(
    path: &Path,
    mapping: &ColumnMapping,
    limits: LoadLimits,
) -> Result<Vec<R>, LoadError> {
    load(path, R::TABLE.schema(), mapping, limits).map(|table| table.typed())
}

// ============================================================================
// REFERENCE LISTS
// ============================================================================

const VENDOR_COLUMNS: &[&str] = &["vendor", "name", "tedarikci", "firma"];
const RATE_COLUMNS: &[&str] = &["vat_rate", "rate", "kdv", "kdv_orani"];
const RATE_KEYS: &[&str] = &["allowed_vat_rates", "rates", "vat_rates"];

/// Values of the first known column (else the first column), blanks dropped.
fn reference_column(path: &Path, candidates: &[&str]) -> Result<Vec<String>, LoadError> {
    let mut source = WindowedRecords::open(path, LoadLimits::unlimited())?;
    let index = candidates
        .iter()
        .find_map(|c| source.headers().iter().position(|h| h == c))
        .unwrap_or(0);

    let mut values = Vec::new();
    while let Some(window) = source.next_window()? {
        values.extend(
            window
                .iter()
                .filter_map(|record| record.get(index))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        );
    }
    Ok(values)
}

/// Allowed vendor names from a CSV list.
pub fn load_vendor_list(path: &Path) -> Result<Vec<String>, LoadError> {
    reference_column(path, VENDOR_COLUMNS)
}

/// Allowed VAT rates from JSON (bare array or keyed object) or CSV.
///
/// Entries that are not numbers are dropped.
pub fn load_vat_rates(path: &Path) -> Result<Vec<f64>, LoadError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if !is_json {
        return Ok(reference_column(path, RATE_COLUMNS)?
            .iter()
            .filter_map(|v| parse_number(v))
            .collect());
    }

    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let payload: Value = serde_json::from_str(&content).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let list = match &payload {
        Value::Array(items) => Some(items),
        Value::Object(object) => RATE_KEYS
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(|v| v.as_array().filter(|items| !items.is_empty())),
        _ => None,
    };

    Ok(list
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_number(s),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn create_test_invoices(dir: &TempDir) -> PathBuf {
        write_file(
            dir,
            "invoices.csv",
            "invoice_id,vendor,date,subtotal,vat_rate,vat_amount,total,po_id,dn_id,notes\n\
             INV-1,Acme,2024-01-05,100,0.18,18,118,PO-1,DN-1,ok\n\
             INV-2,Globex,05.01.2024,50,0.2,10,60,PO-2,DN-2,\n\
             INV-1,Acme,2024/01/06,100,0.18,18,118,PO-1,DN-1,dup\n",
        )
    }

    #[test]
    fn test_load_projects_and_coerces() {
        let dir = TempDir::new().unwrap();
        let path = create_test_invoices(&dir);

        let table = load(
            &path,
            TableKind::Invoices.schema(),
            &ColumnMapping::new(),
            LoadLimits::unlimited(),
        )
        .unwrap();

        // "notes" is not part of the schema and is never read
        assert_eq!(table.columns, TableKind::Invoices.schema().column_names());
        assert_eq!(table.len(), 3);

        let invoices: Vec<InvoiceRow> = table.typed();
        assert_eq!(invoices[0].invoice_id, "INV-1");
        assert_eq!(invoices[0].total, Some(118.0));
        assert_eq!(invoices[1].date, parse_date("2024-01-05"));

        println!("✅ Loaded {} invoices", invoices.len());
    }

    #[test]
    fn test_missing_columns_are_exhaustive() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tickets.csv", "ticket_id,text\nT1,hello\n");

        let err = load(
            &path,
            TableKind::Tickets.schema(),
            &ColumnMapping::from_pairs([("customer_text", "text")]),
            LoadLimits::unlimited(),
        )
        .unwrap_err();

        match err {
            LoadError::Schema(SchemaError::MissingColumns { table, columns }) => {
                assert_eq!(table, "tickets");
                assert_eq!(columns, vec!["created_at", "channel"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_violations_identical_across_window_sizes() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "po.csv",
            "po_id,item_count,total_expected\n\
             PO-1,2,100\n\
             PO-2,two,100\n\
             PO-3,3,lots\n\
             PO-4,x,y\n",
        );
        let schema = TableKind::PurchaseOrders.schema();
        let mapping = ColumnMapping::new();

        let whole = load(&path, schema, &mapping, LoadLimits::unlimited()).unwrap_err();
        let windowed = load(
            &path,
            schema,
            &mapping,
            LoadLimits::unlimited().with_window_size(1),
        )
        .unwrap_err();

        assert_eq!(whole.to_string(), windowed.to_string());
        match whole {
            LoadError::Schema(err) => {
                assert_eq!(err.columns(), vec!["item_count", "total_expected"]);
                assert!(err.to_string().contains("row 2: 'two'"));
                assert!(err.to_string().contains("row 3: 'lots'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_windowed_load_matches_whole_load() {
        let dir = TempDir::new().unwrap();
        let path = create_test_invoices(&dir);
        let schema = TableKind::Invoices.schema();
        let mapping = ColumnMapping::new();

        let whole = load(&path, schema, &mapping, LoadLimits::unlimited()).unwrap();
        for window in 1..=4 {
            let windowed = load(
                &path,
                schema,
                &mapping,
                LoadLimits::unlimited().with_window_size(window),
            )
            .unwrap();
            assert_eq!(windowed, whole);
        }
    }

    #[test]
    fn test_row_cap_and_mapping() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "tickets.csv",
            "\u{feff}Talep ID,Tarih,Kanal,Mesaj,Tutar\n\
             T1,2024-02-01 10:00,email,iade istiyorum,1500\n\
             T2,2024-02-02,chat,kargo nerede,\n\
             T3,2024-02-03,phone,merhaba,10\n",
        );
        let mapping = ColumnMapping::from_pairs([
            ("ticket_id", "Talep ID"),
            ("created_at", "Tarih"),
            ("channel", "Kanal"),
            ("customer_text", "Mesaj"),
            ("amount", "Tutar"),
        ]);

        let tickets: Vec<TicketRow> = load_typed(
            &path,
            &mapping,
            LoadLimits::unlimited().with_max_rows(2).with_window_size(1),
        )
        .unwrap();

        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].ticket_id, "T1");
        assert_eq!(tickets[0].amount, Some(1500.0));
        assert_eq!(tickets[1].amount, None);
        assert_eq!(tickets[1].order_id, None);
    }

    #[test]
    fn test_date_formats() {
        for value in [
            "2024-03-01",
            "2024-03-01 08:30",
            "2024-03-01T08:30:00",
            "2024-03-01T08:30:00Z",
            "2024/03/01",
            "01.03.2024",
            "03/01/2024",
            "25/12/2024",
        ] {
            assert!(parse_date(value).is_some(), "{} should parse", value);
        }
        assert!(parse_date("yesterday").is_none());
        assert!(parse_number(" 12.5 ").is_some());
        assert!(parse_number("inf").is_none());
    }

    #[test]
    fn test_reference_lists() {
        let dir = TempDir::new().unwrap();
        let vendors = write_file(&dir, "vendors.csv", "code,vendor\n1, Acme \n2,\n3,Globex\n");
        assert_eq!(load_vendor_list(&vendors).unwrap(), vec!["Acme", "Globex"]);

        let bare = write_file(&dir, "rates.json", "[0.18, 8, \"1\"]");
        assert_eq!(load_vat_rates(&bare).unwrap(), vec![0.18, 8.0, 1.0]);

        let keyed = write_file(&dir, "keyed.json", r#"{"rates": [], "vat_rates": [0.2]}"#);
        assert_eq!(load_vat_rates(&keyed).unwrap(), vec![0.2]);

        let csv_rates = write_file(&dir, "rates.csv", "kdv\n18\nabc\n0.08\n");
        assert_eq!(load_vat_rates(&csv_rates).unwrap(), vec![18.0, 0.08]);
    }
}
