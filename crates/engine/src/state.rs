use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Canonical datetime format shared by the engine and the sandbox runtime.
/// Changing this breaks replay of previously generated scripts.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column element type. Closed set; adding a dtype means touching every
/// exhaustive match in step application and the sandbox runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Int64,
    Float64,
    Str,
    Bool,
    DateTime,
    Duration,
}

impl Dtype {
    /// Stable name used in generated code (`tab.from_columns` dtype tags).
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Int64 => "int64",
            Dtype::Float64 => "float64",
            Dtype::Str => "str",
            Dtype::Bool => "bool",
            Dtype::DateTime => "datetime",
            Dtype::Duration => "duration",
        }
    }

    pub fn from_name(name: &str) -> Option<Dtype> {
        match name {
            "int64" => Some(Dtype::Int64),
            "float64" => Some(Dtype::Float64),
            "str" => Some(Dtype::Str),
            "bool" => Some(Dtype::Bool),
            "datetime" => Some(Dtype::DateTime),
            "duration" => Some(Dtype::Duration),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One cell. `Missing` survives every cast untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    DateTime(NaiveDateTime),
    /// Whole seconds. Sub-second durations are out of scope.
    Duration(i64),
    Missing,
}

impl CellValue {
    pub fn dtype(&self) -> Option<Dtype> {
        match self {
            CellValue::Int(_) => Some(Dtype::Int64),
            CellValue::Float(_) => Some(Dtype::Float64),
            CellValue::Str(_) => Some(Dtype::Str),
            CellValue::Bool(_) => Some(Dtype::Bool),
            CellValue::DateTime(_) => Some(Dtype::DateTime),
            CellValue::Duration(_) => Some(Dtype::Duration),
            CellValue::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, CellValue::Missing)
    }

    /// Canonical text rendering. `None` for missing cells — a missing value
    /// never becomes the string "nil" or "" by accident.
    pub fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Int(n) => Some(n.to_string()),
            CellValue::Float(n) => Some(format_float(*n)),
            CellValue::Str(s) => Some(s.clone()),
            CellValue::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
            CellValue::DateTime(dt) => Some(dt.format(DATETIME_FORMAT).to_string()),
            CellValue::Duration(secs) => Some(format!("{}s", secs)),
            CellValue::Missing => None,
        }
    }

    /// Parse canonical text back into a value of the given dtype.
    /// Inverse of `to_text` for every non-missing value.
    pub fn parse(text: &str, dtype: Dtype) -> Option<CellValue> {
        match dtype {
            Dtype::Int64 => text.parse::<i64>().ok().map(CellValue::Int),
            Dtype::Float64 => text.parse::<f64>().ok().map(CellValue::Float),
            Dtype::Str => Some(CellValue::Str(text.to_string())),
            Dtype::Bool => match text.to_ascii_lowercase().as_str() {
                "true" => Some(CellValue::Bool(true)),
                "false" => Some(CellValue::Bool(false)),
                _ => None,
            },
            Dtype::DateTime => NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                .ok()
                .map(CellValue::DateTime),
            Dtype::Duration => text
                .strip_suffix('s')
                .and_then(|s| s.parse::<i64>().ok())
                .map(CellValue::Duration),
        }
    }
}

/// Format a float so that whole numbers keep one fractional digit ("1.0"),
/// keeping the text ↔ value mapping unambiguous against int columns.
pub fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

/// A typed column: stable id (never shown to codegen consumers directly),
/// display header (the codegen key), dtype, and values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub header: String,
    pub dtype: Dtype,
    pub values: Vec<CellValue>,
}

impl Column {
    pub fn new(id: impl Into<String>, header: impl Into<String>, dtype: Dtype, values: Vec<CellValue>) -> Self {
        Self { id: id.into(), header: header.into(), dtype, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A named, rectangular collection of typed columns. Column order is
/// significant and preserved through every edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self { name: name.into(), columns }
    }

    pub fn column_by_id(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_index(&self, id: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }

    pub fn headers(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.header.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Structural equality for replay validation: name, headers, dtypes,
    /// values, and column order. Ids are engine-internal and ignored.
    pub fn same_data(&self, other: &Table) -> bool {
        self.name == other.name
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| a.header == b.header && a.dtype == b.dtype && a.values == b.values)
    }
}

/// Per-table header styling declared by the user. Only non-default formats
/// produce styling calls in exported workbooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFormat {
    /// Font color as "#RRGGBB".
    pub color: Option<String>,
    /// Background fill as "#RRGGBB".
    pub background_color: Option<String>,
}

impl HeaderFormat {
    pub fn is_default(&self) -> bool {
        self.color.is_none() && self.background_color.is_none()
    }
}

/// Immutable snapshot of all tables at one point in edit history.
/// Built once per session (empty) and thereafter only by step application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    tables: Vec<Table>,
    formats: Vec<HeaderFormat>,
    session_id: String,
}

impl TableState {
    /// Fresh empty state with a new session id.
    pub fn new_session() -> Self {
        Self {
            tables: Vec::new(),
            formats: Vec::new(),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, index: usize) -> Option<&Table> {
        self.tables.get(index)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn format(&self, index: usize) -> Option<&HeaderFormat> {
        self.formats.get(index)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// New state with one table appended. The only growth path.
    pub fn with_table_added(&self, table: Table, format: HeaderFormat) -> TableState {
        let mut next = self.clone();
        next.tables.push(table);
        next.formats.push(format);
        next
    }

    /// New state with the table at `index` swapped out. Format metadata is
    /// carried forward unchanged.
    pub fn with_table_replaced(&self, index: usize, table: Table) -> TableState {
        let mut next = self.clone();
        next.tables[index] = table;
        next
    }

    /// Table-level equality ignoring session id and formats; used to compare
    /// replayed bindings against engine state.
    pub fn same_tables(&self, others: &[Table]) -> bool {
        self.tables.len() == others.len()
            && self.tables.iter().zip(others.iter()).all(|(a, b)| a.same_data(b))
    }
}
