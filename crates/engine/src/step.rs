//! Typed edit steps: one variant per edit kind, dispatched exhaustively.
//!
//! Each variant knows how to apply itself to a state snapshot and how to
//! emit the script lines that reproduce that application in the sandbox
//! runtime. Code emission consults only the step's parameters and its
//! prev/post states (plus registry codegen metadata for transform calls),
//! never interpreter state, so offline regeneration matches execution.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::caps::{RuntimeCapabilities, MIN_DURATION_REPLACE};
use crate::error::StepError;
use crate::registry::{FnArg, FunctionRegistry};
use crate::state::{CellValue, Column, Dtype, HeaderFormat, Table, TableState};
use crate::transpiler::{lua_str, lua_value_literal};

/// A literal in a step's generated code that can be lifted into a function
/// parameter. `code_text` is the exact substring as emitted, quotes included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLiteral {
    pub code_text: String,
    pub suggested_name: String,
    pub description: String,
}

/// Column specification for a create step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewColumn {
    pub id: String,
    pub header: String,
    pub dtype: Dtype,
    pub values: Vec<CellValue>,
}

/// One atomic edit kind with its concrete parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    /// Create a new table from literal column data.
    CreateTable {
        name: String,
        columns: Vec<NewColumn>,
        header_format: HeaderFormat,
    },
    /// Case-insensitive pattern substitution across selected columns
    /// (all columns when `column_ids` is empty), plus matching headers.
    Replace {
        table_index: usize,
        column_ids: Vec<String>,
        search_value: String,
        replace_value: String,
    },
    /// Apply a registered domain function to one column.
    TransformColumn {
        table_index: usize,
        column_id: String,
        function: String,
        arg: FnArg,
    },
    /// One CSV file per exported table.
    ExportCsv { targets: Vec<(usize, String)> },
    /// One multi-sheet workbook; header styling only for formatted tables.
    ExportWorkbook { path: String, table_indices: Vec<usize> },
}

/// Context a step needs beyond its prev state.
pub struct ApplyContext<'a> {
    pub registry: &'a FunctionRegistry,
    pub capabilities: RuntimeCapabilities,
}

impl StepKind {
    fn step_name(&self) -> &'static str {
        match self {
            StepKind::CreateTable { .. } => "create_table",
            StepKind::Replace { .. } => "replace",
            StepKind::TransformColumn { .. } => "transform_column",
            StepKind::ExportCsv { .. } => "export_csv",
            StepKind::ExportWorkbook { .. } => "export_workbook",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StepKind::CreateTable { .. } => "Create Table",
            StepKind::Replace { .. } => "Replace",
            StepKind::TransformColumn { .. } => "Transform Column",
            StepKind::ExportCsv { .. } => "Export To CSV",
            StepKind::ExportWorkbook { .. } => "Export To Workbook",
        }
    }

    pub fn description(&self, prev: &TableState) -> String {
        match self {
            StepKind::CreateTable { name, columns, .. } => {
                format!("Created {} with {} column(s)", name, columns.len())
            }
            StepKind::Replace { table_index, search_value, replace_value, .. } => {
                let table = table_name(prev, *table_index);
                format!("Replaced {} with {} in {}", search_value, replace_value, table)
            }
            StepKind::TransformColumn { table_index, column_id, function, .. } => {
                let table = table_name(prev, *table_index);
                format!("Applied {} to {} in {}", function, column_id, table)
            }
            StepKind::ExportCsv { targets } => {
                format!("Exported {} table(s) to CSV", targets.len())
            }
            StepKind::ExportWorkbook { path, table_indices } => {
                format!("Exported {} table(s) to {}", table_indices.len(), path)
            }
        }
    }

    /// Table indices this step's apply/code touch. Exports read but never
    /// edit, so they report nothing and never force re-execution.
    pub fn edited_table_indices(&self, post: &TableState) -> Vec<usize> {
        match self {
            StepKind::CreateTable { .. } => vec![post.table_count() - 1],
            StepKind::Replace { table_index, .. } => vec![*table_index],
            StepKind::TransformColumn { table_index, .. } => vec![*table_index],
            StepKind::ExportCsv { .. } | StepKind::ExportWorkbook { .. } => Vec::new(),
        }
    }

    pub fn parameterizable_literals(&self) -> Vec<ParamLiteral> {
        match self {
            StepKind::ExportCsv { targets } => targets
                .iter()
                .map(|(_, path)| ParamLiteral {
                    code_text: lua_str(path),
                    suggested_name: "file_name".into(),
                    description: "CSV export file path".into(),
                })
                .collect(),
            StepKind::ExportWorkbook { path, .. } => vec![ParamLiteral {
                code_text: lua_str(path),
                suggested_name: "file_name".into(),
                description: "Workbook export file path".into(),
            }],
            _ => Vec::new(),
        }
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Pure, deterministic application. On error the caller's log must stay
    /// untouched; this function never mutates `prev`.
    pub fn apply(
        &self,
        prev: &Arc<TableState>,
        ctx: &ApplyContext<'_>,
    ) -> Result<Arc<TableState>, StepError> {
        match self {
            StepKind::CreateTable { name, columns, header_format } => {
                apply_create(prev, name, columns, header_format)
            }
            StepKind::Replace { table_index, column_ids, search_value, replace_value } => {
                apply_replace(prev, *table_index, column_ids, search_value, replace_value, ctx)
            }
            StepKind::TransformColumn { table_index, column_id, function, arg } => {
                apply_transform(prev, *table_index, column_id, function, arg, ctx)
            }
            StepKind::ExportCsv { targets } => {
                for (index, _) in targets {
                    if prev.table(*index).is_none() {
                        return Err(StepError::missing_table(self.step_name(), &index.to_string()));
                    }
                }
                if targets.is_empty() {
                    return Err(StepError::InvalidStep {
                        step: self.step_name(),
                        detail: "no tables selected for export".into(),
                    });
                }
                Ok(prev.clone())
            }
            StepKind::ExportWorkbook { table_indices, .. } => {
                for index in table_indices {
                    if prev.table(*index).is_none() {
                        return Err(StepError::missing_table(self.step_name(), &index.to_string()));
                    }
                }
                if table_indices.is_empty() {
                    return Err(StepError::InvalidStep {
                        step: self.step_name(),
                        detail: "no tables selected for export".into(),
                    });
                }
                Ok(prev.clone())
            }
        }
    }

    // ========================================================================
    // Code emission
    // ========================================================================

    /// Emit (code lines, required import lines) for this step.
    pub fn code(
        &self,
        prev: &TableState,
        post: &TableState,
        registry: &FunctionRegistry,
    ) -> (Vec<String>, Vec<String>) {
        let tab_import = "local tab = require(\"tab\")".to_string();
        match self {
            StepKind::CreateTable { name, columns, .. } => {
                let headers: Vec<String> = columns.iter().map(|c| lua_str(&c.header)).collect();
                let dtypes: Vec<String> = columns.iter().map(|c| lua_str(c.dtype.name())).collect();
                let value_lists: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        let vals: Vec<String> = c.values.iter().map(lua_value_literal).collect();
                        format!("{{{}}}", vals.join(", "))
                    })
                    .collect();
                let line = format!(
                    "{} = tab.from_columns({}, {{{}}}, {{{}}}, {{{}}})",
                    name,
                    lua_str(name),
                    headers.join(", "),
                    dtypes.join(", "),
                    value_lists.join(", "),
                );
                (vec![line], vec![tab_import])
            }
            StepKind::Replace { table_index, column_ids, search_value, replace_value } => {
                let lines = replace_code(prev, *table_index, column_ids, search_value, replace_value);
                (lines, vec![tab_import])
            }
            StepKind::TransformColumn { table_index, column_id, function, arg } => {
                let table = prev.table(*table_index).expect("validated at append");
                let header = table
                    .column_by_id(column_id)
                    .map(|c| c.header.clone())
                    .unwrap_or_else(|| column_id.clone());
                let (import_line, qualified) = match registry.lookup(function) {
                    Some((_, meta)) => (meta.import_line.clone(), meta.qualified_name.clone()),
                    None => (
                        "local fns = require(\"tab_fns\")".to_string(),
                        format!("fns.{}", function),
                    ),
                };
                let arg_text = match arg {
                    FnArg::None => String::new(),
                    FnArg::Int(n) => format!(", {}", n),
                    FnArg::Float(n) => format!(", {}", crate::state::format_float(*n)),
                    FnArg::Str(s) => format!(", {}", lua_str(s)),
                    FnArg::Bool(b) => format!(", {}", b),
                };
                let line = format!(
                    "{t} = tab.set_column({t}, {h}, {f}(tab.column({t}, {h}){a}))",
                    t = table.name,
                    h = lua_str(&header),
                    f = qualified,
                    a = arg_text,
                );
                (vec![line], vec![tab_import, import_line])
            }
            StepKind::ExportCsv { targets } => {
                let lines = targets
                    .iter()
                    .map(|(index, path)| {
                        format!("tab.to_csv({}, {})", table_name(post, *index), lua_str(path))
                    })
                    .collect();
                (lines, vec![tab_import])
            }
            StepKind::ExportWorkbook { path, table_indices } => {
                let mut lines = vec![format!("local writer = tab.workbook({})", lua_str(path))];
                for index in table_indices {
                    let name = table_name(post, *index);
                    lines.push(format!("tab.to_sheet(writer, {t}, {n})", t = name, n = lua_str(&name)));
                }
                // Styling lines only for tables that declare formatting,
                // so default exports emit no no-op styling calls.
                for index in table_indices {
                    if let Some(format) = post.format(*index) {
                        if !format.is_default() {
                            lines.push(style_headers_line(&table_name(post, *index), format));
                        }
                    }
                }
                lines.push("tab.save_workbook(writer)".to_string());
                (lines, vec![tab_import])
            }
        }
    }
}

fn table_name(state: &TableState, index: usize) -> String {
    state
        .table(index)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| format!("t{}", index))
}

fn style_headers_line(table: &str, format: &HeaderFormat) -> String {
    let mut fields = Vec::new();
    if let Some(color) = &format.color {
        fields.push(format!("color = {}", lua_str(color)));
    }
    if let Some(background) = &format.background_color {
        fields.push(format!("background = {}", lua_str(background)));
    }
    format!(
        "tab.style_headers(writer, {}, {{ {} }})",
        lua_str(table),
        fields.join(", "),
    )
}

// ============================================================================
// Create
// ============================================================================

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn apply_create(
    prev: &Arc<TableState>,
    name: &str,
    columns: &[NewColumn],
    header_format: &HeaderFormat,
) -> Result<Arc<TableState>, StepError> {
    if !is_identifier(name) {
        return Err(StepError::InvalidStep {
            step: "create_table",
            detail: format!("table name '{}' is not a valid identifier", name),
        });
    }
    if prev.table_by_name(name).is_some() {
        return Err(StepError::InvalidStep {
            step: "create_table",
            detail: format!("table '{}' already exists", name),
        });
    }
    let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
    for col in columns {
        if col.values.len() != row_count {
            return Err(StepError::InvalidStep {
                step: "create_table",
                detail: format!(
                    "column '{}' has {} row(s), expected {}",
                    col.header,
                    col.values.len(),
                    row_count
                ),
            });
        }
        for value in &col.values {
            if let Some(dtype) = value.dtype() {
                if dtype != col.dtype {
                    return Err(StepError::TypeConversion {
                        table: name.to_string(),
                        column: col.header.clone(),
                        dtype: col.dtype,
                        value: value.to_text().unwrap_or_default(),
                    });
                }
            }
        }
    }
    let table = Table::new(
        name,
        columns
            .iter()
            .map(|c| Column::new(c.id.clone(), c.header.clone(), c.dtype, c.values.clone()))
            .collect(),
    );
    Ok(Arc::new(prev.with_table_added(table, header_format.clone())))
}

// ============================================================================
// Replace
// ============================================================================

fn compile_search(search: &str) -> Result<Regex, StepError> {
    Regex::new(&format!("(?i){}", search)).map_err(|e| StepError::InvalidStep {
        step: "replace",
        detail: format!("invalid search pattern '{}': {}", search, e),
    })
}

/// Indices of the columns a replace targets: the explicit selection, or
/// every column when none was selected.
fn selected_indices(table: &Table, column_ids: &[String]) -> Result<Vec<usize>, StepError> {
    if column_ids.is_empty() {
        return Ok((0..table.columns.len()).collect());
    }
    column_ids
        .iter()
        .map(|id| {
            table
                .column_index(id)
                .ok_or_else(|| StepError::missing_column("replace", &table.name, id))
        })
        .collect()
}

fn apply_replace(
    prev: &Arc<TableState>,
    table_index: usize,
    column_ids: &[String],
    search_value: &str,
    replace_value: &str,
    ctx: &ApplyContext<'_>,
) -> Result<Arc<TableState>, StepError> {
    let table = prev
        .table(table_index)
        .ok_or_else(|| StepError::missing_table("replace", &table_index.to_string()))?;
    let selected = selected_indices(table, column_ids)?;
    let re = compile_search(search_value)?;

    // Version gate before any work: pattern substitution on duration columns
    // is unsupported below the minimum runtime.
    for &i in &selected {
        let col = &table.columns[i];
        if col.dtype == Dtype::Duration && ctx.capabilities.version < MIN_DURATION_REPLACE {
            return Err(StepError::CapabilityVersion {
                operation: "pattern replace",
                dtype: Dtype::Duration,
                minimum: MIN_DURATION_REPLACE,
                current: ctx.capabilities.version,
            });
        }
    }

    let mut next = table.clone();
    for &i in &selected {
        let col = &mut next.columns[i];
        match col.dtype {
            // Booleans go text → substitute → explicit string-to-bool map.
            // A generic cast is unsound here: any non-empty string (including
            // "false") would coerce to true.
            Dtype::Bool => {
                for value in &mut col.values {
                    let CellValue::Bool(b) = *value else { continue };
                    let text = if b { "true" } else { "false" };
                    let replaced = re.replace_all(text, replace_value);
                    if replaced != text {
                        *value = match replaced.to_ascii_lowercase().as_str() {
                            "true" => CellValue::Bool(true),
                            "false" => CellValue::Bool(false),
                            other => {
                                return Err(StepError::TypeConversion {
                                    table: table.name.clone(),
                                    column: col.header.clone(),
                                    dtype: Dtype::Bool,
                                    value: other.to_string(),
                                })
                            }
                        };
                    }
                }
            }
            // Everything else: text → substitute → parse back to the
            // original dtype. Missing cells pass through untouched.
            dtype => {
                for value in &mut col.values {
                    let Some(text) = value.to_text() else { continue };
                    let replaced = re.replace_all(&text, replace_value);
                    if replaced != text {
                        *value = CellValue::parse(&replaced, dtype).ok_or_else(|| {
                            StepError::TypeConversion {
                                table: table.name.clone(),
                                column: col.header.clone(),
                                dtype,
                                value: replaced.to_string(),
                            }
                        })?;
                    }
                }
            }
        }
    }

    // Headers matching the pattern are substituted too.
    for &i in &selected {
        let col = &mut next.columns[i];
        if re.is_match(&col.header) {
            col.header = re.replace_all(&col.header, replace_value).into_owned();
        }
    }

    Ok(Arc::new(prev.with_table_replaced(table_index, next)))
}

fn replace_code(
    prev: &TableState,
    table_index: usize,
    column_ids: &[String],
    search_value: &str,
    replace_value: &str,
) -> Vec<String> {
    let table = prev.table(table_index).expect("validated at append");
    let t = &table.name;
    let pat = lua_str(&format!("(?i){}", search_value));
    let rep = lua_str(replace_value);

    let selected: Vec<&Column> = if column_ids.is_empty() {
        table.columns.iter().collect()
    } else {
        column_ids
            .iter()
            .filter_map(|id| table.column_by_id(id))
            .collect()
    };
    let has_bool = selected.iter().any(|c| c.dtype == Dtype::Bool);

    let mut lines = Vec::new();
    let target = if column_ids.is_empty() {
        t.clone()
    } else {
        let headers: Vec<String> = selected.iter().map(|c| lua_str(&c.header)).collect();
        lines.push(format!("local {t}_target = tab.select({t}, {{{}}})", headers.join(", ")));
        format!("{t}_target")
    };

    if has_bool {
        lines.push(format!("local {t}_rest, {t}_bools = tab.split_bool({target})"));
        lines.push(format!(
            "{t} = tab.with_columns({t}, tab.cast(tab.replace_pattern(tab.cast({t}_rest, \"str\"), {pat}, {rep}), tab.dtypes({t}_rest)))"
        ));
        lines.push(format!(
            "{t} = tab.with_columns({t}, tab.cast_string_to_bool(tab.replace_pattern(tab.cast({t}_bools, \"str\"), {pat}, {rep})))"
        ));
    } else {
        lines.push(format!(
            "{t} = tab.with_columns({t}, tab.cast(tab.replace_pattern(tab.cast({target}, \"str\"), {pat}, {rep}), tab.dtypes({target})))"
        ));
    }

    // Header substitution line only when a selected header actually matches.
    let header_match = Regex::new(&format!("(?i){}", search_value))
        .map(|re| selected.iter().any(|c| re.is_match(&c.header)))
        .unwrap_or(false);
    if header_match {
        let cols = if column_ids.is_empty() {
            "nil".to_string()
        } else {
            let headers: Vec<String> = selected.iter().map(|c| lua_str(&c.header)).collect();
            format!("{{{}}}", headers.join(", "))
        };
        lines.push(format!("{t} = tab.rename_matching({t}, {cols}, {pat}, {rep})"));
    }

    lines
}

// ============================================================================
// Transform
// ============================================================================

fn apply_transform(
    prev: &Arc<TableState>,
    table_index: usize,
    column_id: &str,
    function: &str,
    arg: &FnArg,
    ctx: &ApplyContext<'_>,
) -> Result<Arc<TableState>, StepError> {
    let table = prev
        .table(table_index)
        .ok_or_else(|| StepError::missing_table("transform_column", &table_index.to_string()))?;
    let col_index = table
        .column_index(column_id)
        .ok_or_else(|| StepError::missing_column("transform_column", &table.name, column_id))?;
    let (func, _) = ctx.registry.lookup(function).ok_or_else(|| StepError::InvalidStep {
        step: "transform_column",
        detail: format!("unknown function '{}'", function),
    })?;

    let transformed = func(&table.columns[col_index], arg)?;
    let mut next = table.clone();
    next.columns[col_index] = transformed;
    Ok(Arc::new(prev.with_table_replaced(table_index, next)))
}

// ============================================================================
// Step record
// ============================================================================

/// One immutable record in the log arena: never mutated after creation.
#[derive(Clone)]
pub struct Step {
    pub index: usize,
    pub prev_state: Arc<TableState>,
    pub post_state: Arc<TableState>,
    pub kind: StepKind,
}

impl Step {
    pub fn display_name(&self) -> &'static str {
        self.kind.display_name()
    }

    pub fn description(&self) -> String {
        self.kind.description(&self.prev_state)
    }

    pub fn edited_table_indices(&self) -> Vec<usize> {
        self.kind.edited_table_indices(&self.post_state)
    }

    pub fn parameterizable_literals(&self) -> Vec<ParamLiteral> {
        self.kind.parameterizable_literals()
    }

    pub fn code(&self, registry: &FunctionRegistry) -> (Vec<String>, Vec<String>) {
        self.kind.code(&self.prev_state, &self.post_state, registry)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("index", &self.index)
            .field("kind", &self.kind.display_name())
            .finish()
    }
}
