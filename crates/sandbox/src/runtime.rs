//! The `tab` Lua module: the runtime surface generated scripts call into.
//!
//! Every function builds a fresh value from its inputs; nothing mutates a
//! table a script already holds, matching the engine's snapshot model.
//! Semantics mirror the engine's step application exactly, so replaying a
//! generated script lands on the same data the engine computed.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Lua, Table as LuaTable, UserData, UserDataRef, Value};
use regex::Regex;
use tablog_engine::{CellValue, Column, Dtype, Table};

use crate::export::{self, WorkbookBuild};

/// An engine table held in Lua as opaque userdata.
pub struct TabValue(pub Table);
impl UserData for TabValue {}

/// A single column in transit through a transform call.
pub struct ColumnVal(pub Column);
impl UserData for ColumnVal {}

/// Dtype list captured before a cast-to-text, used to cast back.
pub struct DtypesVal(Vec<Dtype>);
impl UserData for DtypesVal {}

/// Missing-cell sentinel. A nil would terminate the surrounding Lua array
/// literal, so scripts spell missing cells as `tab.na`.
pub struct Na;
impl UserData for Na {}

/// Pending workbook export, saved on `tab.save_workbook`.
pub struct WriterVal(pub Rc<RefCell<WorkbookBuild>>);
impl UserData for WriterVal {}

pub(crate) fn runtime_err(msg: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(msg.into())
}

/// Register the `tab` module under `package.loaded`.
pub fn register(lua: &Lua) -> mlua::Result<()> {
    let tab = lua.create_table()?;
    tab.set("na", lua.create_userdata(Na)?)?;
    tab.set("from_columns", lua.create_function(from_columns)?)?;
    tab.set("select", lua.create_function(select)?)?;
    tab.set("cast", lua.create_function(cast)?)?;
    tab.set("dtypes", lua.create_function(dtypes)?)?;
    tab.set("replace_pattern", lua.create_function(replace_pattern)?)?;
    tab.set("with_columns", lua.create_function(with_columns)?)?;
    tab.set("split_bool", lua.create_function(split_bool)?)?;
    tab.set("cast_string_to_bool", lua.create_function(cast_string_to_bool)?)?;
    tab.set("rename_matching", lua.create_function(rename_matching)?)?;
    tab.set("column", lua.create_function(column)?)?;
    tab.set("set_column", lua.create_function(set_column)?)?;
    tab.set("to_csv", lua.create_function(to_csv)?)?;
    tab.set("workbook", lua.create_function(workbook)?)?;
    tab.set("to_sheet", lua.create_function(to_sheet)?)?;
    tab.set("style_headers", lua.create_function(style_headers)?)?;
    tab.set("save_workbook", lua.create_function(save_workbook)?)?;

    let package: LuaTable = lua.globals().get("package")?;
    let loaded: LuaTable = package.get("loaded")?;
    loaded.set("tab", tab)?;
    Ok(())
}

// ============================================================================
// Construction
// ============================================================================

fn cell_from_lua(value: &Value, dtype: Dtype) -> mlua::Result<CellValue> {
    if let Value::UserData(ud) = value {
        if ud.is::<Na>() {
            return Ok(CellValue::Missing);
        }
    }
    let cell = match (dtype, value) {
        (Dtype::Int64, Value::Integer(n)) => Some(CellValue::Int(*n)),
        (Dtype::Int64, Value::Number(n)) if n.fract() == 0.0 => Some(CellValue::Int(*n as i64)),
        (Dtype::Float64, Value::Number(n)) => Some(CellValue::Float(*n)),
        (Dtype::Float64, Value::Integer(n)) => Some(CellValue::Float(*n as f64)),
        (Dtype::Str, Value::String(s)) => Some(CellValue::Str(s.to_str()?.to_string())),
        (Dtype::Bool, Value::Boolean(b)) => Some(CellValue::Bool(*b)),
        (Dtype::DateTime, Value::String(s)) => CellValue::parse(&s.to_str()?, Dtype::DateTime),
        (Dtype::Duration, Value::Integer(n)) => Some(CellValue::Duration(*n)),
        _ => None,
    };
    cell.ok_or_else(|| runtime_err(format!("value does not fit dtype {}", dtype)))
}

fn from_columns(
    _lua: &Lua,
    (name, headers, dtype_names, value_lists): (String, Vec<String>, Vec<String>, LuaTable),
) -> mlua::Result<TabValue> {
    if headers.len() != dtype_names.len() {
        return Err(runtime_err("headers and dtypes must have the same length"));
    }
    let mut columns = Vec::with_capacity(headers.len());
    for (i, (header, dtype_name)) in headers.iter().zip(&dtype_names).enumerate() {
        let dtype = Dtype::from_name(dtype_name)
            .ok_or_else(|| runtime_err(format!("unknown dtype '{}'", dtype_name)))?;
        let values_table: LuaTable = value_lists.get(i + 1)?;
        let mut values = Vec::with_capacity(values_table.raw_len());
        for v in values_table.sequence_values::<Value>() {
            values.push(cell_from_lua(&v?, dtype)?);
        }
        columns.push(Column::new(header.clone(), header.clone(), dtype, values));
    }
    Ok(TabValue(Table::new(name, columns)))
}

// ============================================================================
// Column selection and casting
// ============================================================================

fn find_column<'a>(table: &'a Table, header: &str) -> mlua::Result<&'a Column> {
    table
        .columns
        .iter()
        .find(|c| c.header == header)
        .ok_or_else(|| runtime_err(format!("table '{}' has no column '{}'", table.name, header)))
}

fn select(
    _lua: &Lua,
    (t, headers): (UserDataRef<TabValue>, Vec<String>),
) -> mlua::Result<TabValue> {
    let table = &t.0;
    let mut columns = Vec::with_capacity(headers.len());
    for header in &headers {
        columns.push(find_column(table, header)?.clone());
    }
    Ok(TabValue(Table::new(table.name.clone(), columns)))
}

fn dtypes(_lua: &Lua, t: UserDataRef<TabValue>) -> mlua::Result<DtypesVal> {
    Ok(DtypesVal(t.0.columns.iter().map(|c| c.dtype).collect()))
}

fn cast(_lua: &Lua, (t, spec): (UserDataRef<TabValue>, Value)) -> mlua::Result<TabValue> {
    let table = &t.0;
    match &spec {
        Value::String(s) => {
            if &*s.to_str()? != "str" {
                return Err(runtime_err("cast expects \"str\" or a dtypes value"));
            }
            let columns = table
                .columns
                .iter()
                .map(|col| {
                    let values = col
                        .values
                        .iter()
                        .map(|v| match v.to_text() {
                            Some(text) => CellValue::Str(text),
                            None => CellValue::Missing,
                        })
                        .collect();
                    Column::new(col.id.clone(), col.header.clone(), Dtype::Str, values)
                })
                .collect();
            Ok(TabValue(Table::new(table.name.clone(), columns)))
        }
        Value::UserData(ud) => {
            let targets = ud
                .borrow::<DtypesVal>()
                .map_err(|_| runtime_err("cast expects \"str\" or a dtypes value"))?;
            if targets.0.len() != table.columns.len() {
                return Err(runtime_err(format!(
                    "cast: {} dtype(s) for {} column(s)",
                    targets.0.len(),
                    table.columns.len()
                )));
            }
            let mut columns = Vec::with_capacity(table.columns.len());
            for (col, &dtype) in table.columns.iter().zip(&targets.0) {
                let mut values = Vec::with_capacity(col.values.len());
                for value in &col.values {
                    let cell = match value.to_text() {
                        None => CellValue::Missing,
                        Some(text) => CellValue::parse(&text, dtype).ok_or_else(|| {
                            runtime_err(format!(
                                "table '{}', column '{}': cannot convert '{}' back to {}",
                                table.name, col.header, text, dtype
                            ))
                        })?,
                    };
                    values.push(cell);
                }
                columns.push(Column::new(col.id.clone(), col.header.clone(), dtype, values));
            }
            Ok(TabValue(Table::new(table.name.clone(), columns)))
        }
        _ => Err(runtime_err("cast expects \"str\" or a dtypes value")),
    }
}

// ============================================================================
// Substitution
// ============================================================================

fn replace_pattern(
    _lua: &Lua,
    (t, pattern, replacement): (UserDataRef<TabValue>, String, String),
) -> mlua::Result<TabValue> {
    let table = &t.0;
    let re = Regex::new(&pattern)
        .map_err(|e| runtime_err(format!("invalid pattern '{}': {}", pattern, e)))?;
    let mut columns = Vec::with_capacity(table.columns.len());
    for col in &table.columns {
        if col.dtype != Dtype::Str {
            return Err(runtime_err(format!(
                "replace_pattern expects text columns, '{}' is {}",
                col.header, col.dtype
            )));
        }
        let values = col
            .values
            .iter()
            .map(|v| match v {
                CellValue::Str(s) => CellValue::Str(re.replace_all(s, replacement.as_str()).into_owned()),
                other => other.clone(),
            })
            .collect();
        columns.push(Column::new(col.id.clone(), col.header.clone(), Dtype::Str, values));
    }
    Ok(TabValue(Table::new(table.name.clone(), columns)))
}

fn with_columns(
    _lua: &Lua,
    (t, modified): (UserDataRef<TabValue>, UserDataRef<TabValue>),
) -> mlua::Result<TabValue> {
    let mut table = t.0.clone();
    for col in &modified.0.columns {
        let index = table
            .columns
            .iter()
            .position(|c| c.id == col.id)
            .ok_or_else(|| runtime_err(format!("table '{}' has no column '{}'", table.name, col.header)))?;
        table.columns[index] = col.clone();
    }
    Ok(TabValue(table))
}

fn split_bool(_lua: &Lua, t: UserDataRef<TabValue>) -> mlua::Result<(TabValue, TabValue)> {
    let table = &t.0;
    let (bools, rest): (Vec<Column>, Vec<Column>) = table
        .columns
        .iter()
        .cloned()
        .partition(|c| c.dtype == Dtype::Bool);
    Ok((
        TabValue(Table::new(table.name.clone(), rest)),
        TabValue(Table::new(table.name.clone(), bools)),
    ))
}

/// Strict text-to-bool: only "true"/"false" (any case) convert. A generic
/// cast would turn every non-empty string into true.
fn cast_string_to_bool(_lua: &Lua, t: UserDataRef<TabValue>) -> mlua::Result<TabValue> {
    let table = &t.0;
    let mut columns = Vec::with_capacity(table.columns.len());
    for col in &table.columns {
        let mut values = Vec::with_capacity(col.values.len());
        for value in &col.values {
            let cell = match value {
                CellValue::Missing => CellValue::Missing,
                CellValue::Str(s) => match s.to_ascii_lowercase().as_str() {
                    "true" => CellValue::Bool(true),
                    "false" => CellValue::Bool(false),
                    other => {
                        return Err(runtime_err(format!(
                            "table '{}', column '{}': cannot convert '{}' back to bool",
                            table.name, col.header, other
                        )))
                    }
                },
                other => {
                    return Err(runtime_err(format!(
                        "cast_string_to_bool expects text cells, got {:?}",
                        other.dtype()
                    )))
                }
            };
            values.push(cell);
        }
        columns.push(Column::new(col.id.clone(), col.header.clone(), Dtype::Bool, values));
    }
    Ok(TabValue(Table::new(table.name.clone(), columns)))
}

fn rename_matching(
    _lua: &Lua,
    (t, selection, pattern, replacement): (UserDataRef<TabValue>, Option<Vec<String>>, String, String),
) -> mlua::Result<TabValue> {
    let re = Regex::new(&pattern)
        .map_err(|e| runtime_err(format!("invalid pattern '{}': {}", pattern, e)))?;
    let mut table = t.0.clone();
    for col in &mut table.columns {
        let selected = match &selection {
            None => true,
            Some(headers) => headers.iter().any(|h| h == &col.header),
        };
        if selected && re.is_match(&col.header) {
            col.header = re.replace_all(&col.header, replacement.as_str()).into_owned();
        }
    }
    Ok(TabValue(table))
}

// ============================================================================
// Single-column access
// ============================================================================

fn column(_lua: &Lua, (t, header): (UserDataRef<TabValue>, String)) -> mlua::Result<ColumnVal> {
    Ok(ColumnVal(find_column(&t.0, &header)?.clone()))
}

fn set_column(
    _lua: &Lua,
    (t, header, col): (UserDataRef<TabValue>, String, UserDataRef<ColumnVal>),
) -> mlua::Result<TabValue> {
    let mut table = t.0.clone();
    let index = table
        .columns
        .iter()
        .position(|c| c.header == header)
        .ok_or_else(|| runtime_err(format!("table '{}' has no column '{}'", table.name, header)))?;
    table.columns[index] = col.0.clone();
    Ok(TabValue(table))
}

// ============================================================================
// Exports
// ============================================================================

fn to_csv(_lua: &Lua, (t, path): (UserDataRef<TabValue>, String)) -> mlua::Result<()> {
    export::write_csv(&t.0, std::path::Path::new(&path)).map_err(runtime_err)
}

fn workbook(_lua: &Lua, path: String) -> mlua::Result<WriterVal> {
    Ok(WriterVal(Rc::new(RefCell::new(WorkbookBuild::new(path)))))
}

fn to_sheet(
    _lua: &Lua,
    (writer, t, name): (UserDataRef<WriterVal>, UserDataRef<TabValue>, String),
) -> mlua::Result<()> {
    writer.0.borrow_mut().add_sheet(name, t.0.clone());
    Ok(())
}

fn style_headers(
    _lua: &Lua,
    (writer, name, opts): (UserDataRef<WriterVal>, String, LuaTable),
) -> mlua::Result<()> {
    let color: Option<String> = opts.get("color")?;
    let background: Option<String> = opts.get("background")?;
    writer.0.borrow_mut().style_sheet(name, color, background);
    Ok(())
}

fn save_workbook(_lua: &Lua, writer: UserDataRef<WriterVal>) -> mlua::Result<()> {
    export::write_workbook(&writer.0.borrow()).map_err(runtime_err)
}
