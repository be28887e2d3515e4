//! Isolated Lua runtime for generated edit scripts.
//!
//! Each [`execute`] call builds a fresh interpreter with only the string,
//! table, math, and package libraries, registers the `tab` and `tab_fns`
//! modules, and runs the script under an instruction-count hook that
//! enforces a wall-clock budget. Nothing survives between calls, and a
//! runaway or failing script cannot touch the caller's state.

pub mod export;
pub mod fns;
mod runtime;

pub use runtime::{ColumnVal, Na, TabValue};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Table as LuaTable, Value, VmState};
use tablog_engine::{ExecutionError, Table};

/// Result of a successful script run: every table left in a global
/// variable, keyed and sorted by variable name, plus captured print output.
#[derive(Debug)]
pub struct ExecOutcome {
    pub tables: Vec<(String, Table)>,
    pub printed: String,
}

// Instruction granularity for the deadline check. Coarse enough to stay
// off the hot path, fine enough to stop a runaway loop within milliseconds.
const HOOK_INSTRUCTION_INTERVAL: u32 = 8192;

fn lua_display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
        other => other.type_name().to_string(),
    }
}

fn build_interpreter(printed: Rc<RefCell<String>>) -> mlua::Result<Lua> {
    // No io, no os, no debug: scripts only reach the filesystem through
    // the export functions the tab module provides.
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::PACKAGE,
        LuaOptions::default(),
    )?;
    runtime::register(&lua)?;
    fns::register(&lua)?;

    // The package library stays only so require() resolves the modules
    // registered above through package.loaded. Everything that would let a
    // script load code from disk is stripped: loadlib, the search paths,
    // and every searcher past the preload one.
    let package: LuaTable = lua.globals().get("package")?;
    package.set("loadlib", Value::Nil)?;
    package.set("path", "")?;
    package.set("cpath", "")?;
    let searchers: LuaTable = package.get("searchers")?;
    for index in (2..=searchers.raw_len()).rev() {
        searchers.raw_set(index, Value::Nil)?;
    }

    let print = lua.create_function(move |_, args: mlua::MultiValue| {
        let parts: Vec<String> = args.iter().map(lua_display).collect();
        let mut buf = printed.borrow_mut();
        buf.push_str(&parts.join("\t"));
        buf.push('\n');
        Ok(())
    })?;
    lua.globals().set("print", print)?;
    Ok(lua)
}

fn collect_tables(lua: &Lua) -> mlua::Result<Vec<(String, Table)>> {
    let mut tables = Vec::new();
    for pair in lua.globals().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let (Value::String(name), Value::UserData(ud)) = (key, value) else {
            continue;
        };
        if let Ok(tab) = ud.borrow::<TabValue>() {
            tables.push((name.to_str()?.to_string(), tab.0.clone()));
        }
    }
    tables.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tables)
}

/// Run `code` in a fresh interpreter with no seeded tables.
pub fn execute(code: &str, timeout: Duration) -> Result<ExecOutcome, ExecutionError> {
    execute_with_bindings(code, &[], timeout)
}

/// Run `code` in a fresh interpreter seeded with `initial_bindings` as
/// global table values. Errors carry whatever the script printed before
/// failing.
pub fn execute_with_bindings(
    code: &str,
    initial_bindings: &[(String, Table)],
    timeout: Duration,
) -> Result<ExecOutcome, ExecutionError> {
    let printed = Rc::new(RefCell::new(String::new()));
    let lua = build_interpreter(printed.clone())
        .map_err(|e| ExecutionError { message: e.to_string(), output: String::new() })?;

    for (name, table) in initial_bindings {
        lua.globals()
            .set(name.as_str(), TabValue(table.clone()))
            .map_err(|e| ExecutionError { message: e.to_string(), output: String::new() })?;
    }

    let deadline = Instant::now() + timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError("script exceeded its time budget".into()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    if let Err(e) = lua.load(code).set_name("edit_script").exec() {
        return Err(ExecutionError {
            message: e.to_string(),
            output: printed.borrow().clone(),
        });
    }
    lua.remove_hook();

    let tables = collect_tables(&lua)
        .map_err(|e| ExecutionError { message: e.to_string(), output: printed.borrow().clone() })?;
    let printed = printed.borrow().clone();
    Ok(ExecOutcome { tables, printed })
}
