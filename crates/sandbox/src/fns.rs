//! Column transform functions, exposed twice: to the engine as a
//! [`FunctionRegistry`] and to Lua as the `tab_fns` module. Both sides
//! call the same Rust implementations, so engine application and script
//! replay cannot drift apart.

use std::sync::Arc;

use mlua::{Lua, Table as LuaTable, UserDataRef, Value};
use tablog_engine::registry::{CodegenMeta, FnArg, FunctionRegistry};
use tablog_engine::{CellValue, Column, Dtype, StepError};

use crate::runtime::{runtime_err, ColumnVal};

const FNS_IMPORT: &str = "local fns = require(\"tab_fns\")";

fn invalid(detail: String) -> StepError {
    StepError::InvalidStep { step: "transform_column", detail }
}

/// Coerce a transform argument to a fill value for `dtype`.
fn fill_value(arg: &FnArg, dtype: Dtype) -> Result<CellValue, StepError> {
    let cell = match (dtype, arg) {
        (Dtype::Int64, FnArg::Int(n)) => Some(CellValue::Int(*n)),
        (Dtype::Float64, FnArg::Float(n)) => Some(CellValue::Float(*n)),
        (Dtype::Float64, FnArg::Int(n)) => Some(CellValue::Float(*n as f64)),
        (Dtype::Str, FnArg::Str(s)) => Some(CellValue::Str(s.clone())),
        (Dtype::Bool, FnArg::Bool(b)) => Some(CellValue::Bool(*b)),
        (Dtype::Duration, FnArg::Int(n)) => Some(CellValue::Duration(*n)),
        (Dtype::DateTime, FnArg::Str(s)) => CellValue::parse(s, Dtype::DateTime),
        _ => None,
    };
    cell.ok_or_else(|| invalid(format!("fill value {:?} does not fit a {} column", arg, dtype)))
}

pub fn fill_missing(column: &Column, arg: &FnArg) -> Result<Column, StepError> {
    let fill = fill_value(arg, column.dtype)?;
    let mut out = column.clone();
    for value in &mut out.values {
        if value.is_missing() {
            *value = fill.clone();
        }
    }
    Ok(out)
}

pub fn to_uppercase(column: &Column, arg: &FnArg) -> Result<Column, StepError> {
    if !matches!(arg, FnArg::None) {
        return Err(invalid("to_uppercase takes no argument".into()));
    }
    if column.dtype != Dtype::Str {
        return Err(invalid(format!(
            "to_uppercase expects a text column, '{}' is {}",
            column.header, column.dtype
        )));
    }
    let mut out = column.clone();
    for value in &mut out.values {
        if let CellValue::Str(s) = value {
            *s = s.to_uppercase();
        }
    }
    Ok(out)
}

/// The registry every manager starts from.
pub fn standard_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register(
        "fill_missing",
        Arc::new(fill_missing),
        CodegenMeta {
            import_line: FNS_IMPORT.to_string(),
            qualified_name: "fns.fill_missing".to_string(),
        },
    );
    registry.register(
        "to_uppercase",
        Arc::new(to_uppercase),
        CodegenMeta {
            import_line: FNS_IMPORT.to_string(),
            qualified_name: "fns.to_uppercase".to_string(),
        },
    );
    registry
}

// ============================================================================
// Lua bindings
// ============================================================================

fn fn_arg_from_lua(value: Option<&Value>) -> mlua::Result<FnArg> {
    Ok(match value {
        None | Some(Value::Nil) => FnArg::None,
        Some(Value::Integer(n)) => FnArg::Int(*n),
        Some(Value::Number(n)) => FnArg::Float(*n),
        Some(Value::Boolean(b)) => FnArg::Bool(*b),
        Some(Value::String(s)) => FnArg::Str(s.to_str()?.to_string()),
        Some(other) => {
            return Err(runtime_err(format!(
                "unsupported transform argument type {}",
                other.type_name()
            )))
        }
    })
}

/// Register the `tab_fns` module under `package.loaded`.
pub fn register(lua: &Lua) -> mlua::Result<()> {
    let fns = lua.create_table()?;
    fns.set(
        "fill_missing",
        lua.create_function(|_, (col, arg): (UserDataRef<ColumnVal>, Option<Value>)| {
            let arg = fn_arg_from_lua(arg.as_ref())?;
            fill_missing(&col.0, &arg)
                .map(ColumnVal)
                .map_err(|e| runtime_err(e.to_string()))
        })?,
    )?;
    fns.set(
        "to_uppercase",
        lua.create_function(|_, col: UserDataRef<ColumnVal>| {
            to_uppercase(&col.0, &FnArg::None)
                .map(ColumnVal)
                .map_err(|e| runtime_err(e.to_string()))
        })?,
    )?;

    let package: LuaTable = lua.globals().get("package")?;
    let loaded: LuaTable = package.get("loaded")?;
    loaded.set("tab_fns", fns)?;
    Ok(())
}
