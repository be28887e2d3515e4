//! Folds a run of active steps into one runnable script.
//!
//! Output layout: deduplicated imports in first-seen order, a blank line,
//! then per step a `--` description comment and its code lines, steps
//! separated by blank lines. Transpilation reads the steps and nothing
//! else, so the same log always yields the same script.

use crate::error::TranspileError;
use crate::registry::FunctionRegistry;
use crate::state::{CellValue, DATETIME_FORMAT};
use crate::step::Step;

/// Indent unit for generated function bodies.
pub const TAB: &str = "    ";

/// Quote a string as a Lua literal.
pub fn lua_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render one cell as a Lua literal. Missing cells use the `tab.na`
/// sentinel; nil would truncate the surrounding array literal.
pub fn lua_value_literal(value: &CellValue) -> String {
    match value {
        CellValue::Int(n) => n.to_string(),
        CellValue::Float(n) => crate::state::format_float(*n),
        CellValue::Str(s) => lua_str(s),
        CellValue::Bool(b) => b.to_string(),
        CellValue::DateTime(dt) => lua_str(&dt.format(DATETIME_FORMAT).to_string()),
        CellValue::Duration(secs) => secs.to_string(),
        CellValue::Missing => "tab.na".to_string(),
    }
}

/// Identifies one parameterizable literal inside a step range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralSelection {
    /// Index into the step slice being transpiled, not the full log.
    pub step_index: usize,
    /// Index into that step's `parameterizable_literals()`.
    pub literal_index: usize,
}

/// A script lifted into a reusable function plus a ready-made call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterizedCode {
    pub function_source: String,
    pub call_site: String,
    /// (parameter name, original literal text) pairs in signature order.
    pub params: Vec<(String, String)>,
}

impl ParameterizedCode {
    /// Substitute the original literals back in and unwrap the function
    /// body. The result is byte-identical to the plain transpilation of
    /// the same steps.
    pub fn inline(&self) -> String {
        let lines: Vec<&str> = self.function_source.lines().collect();
        debug_assert!(lines.first().map_or(false, |l| l.starts_with("function ")));
        debug_assert_eq!(lines.last().copied(), Some("end"));
        let body = &lines[1..lines.len().saturating_sub(1)];
        let mut out = String::new();
        for line in body {
            let stripped = line.strip_prefix(TAB).unwrap_or(line);
            out.push_str(stripped);
            out.push('\n');
        }
        for (name, literal) in &self.params {
            out = replace_identifier(&out, name, literal);
        }
        out
    }
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace every standalone occurrence of identifier `name`. A match
/// bordered by another identifier character is a longer name (`p_1` inside
/// `p_10`) and is left alone.
fn replace_identifier(source: &str, name: &str, replacement: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut from = 0;
    while let Some(offset) = source[from..].find(name) {
        let at = from + offset;
        let end = at + name.len();
        let left_clear = at == 0 || !is_identifier_byte(bytes[at - 1]);
        let right_clear = end == source.len() || !is_identifier_byte(bytes[end]);
        out.push_str(&source[from..at]);
        if left_clear && right_clear {
            out.push_str(replacement);
        } else {
            out.push_str(&source[at..end]);
        }
        from = end;
    }
    out.push_str(&source[from..]);
    out
}

// ============================================================================
// Rendering
// ============================================================================

/// Body lines for a step range: imports, blank line, commented step blocks.
fn render(steps: &[Step], registry: &FunctionRegistry, params: &[(LiteralSelection, String)]) -> Vec<String> {
    let mut imports: Vec<String> = Vec::new();
    let mut blocks: Vec<Vec<String>> = Vec::new();

    for (step_index, step) in steps.iter().enumerate() {
        let (mut lines, step_imports) = step.code(registry);
        for import in step_imports {
            if !imports.contains(&import) {
                imports.push(import);
            }
        }
        // Swap selected literals for their parameter names. Duplicate
        // literal text within one step is disambiguated by occurrence
        // ordinal, which follows literal order. Substitute highest ordinal
        // first: once an occurrence becomes a parameter name it no longer
        // counts as a match, which would shift later ordinals.
        let literals = step.parameterizable_literals();
        let mut substitutions: Vec<(usize, &str, &str)> = Vec::new();
        for (selection, name) in params {
            if selection.step_index != step_index {
                continue;
            }
            let literal = &literals[selection.literal_index];
            let ordinal = literals[..selection.literal_index]
                .iter()
                .filter(|l| l.code_text == literal.code_text)
                .count();
            substitutions.push((ordinal, literal.code_text.as_str(), name.as_str()));
        }
        substitutions.sort_by(|a, b| b.0.cmp(&a.0));
        for (ordinal, needle, name) in substitutions {
            replace_nth(&mut lines, needle, ordinal, name);
        }
        let mut block = vec![format!("-- {}", step.description())];
        block.append(&mut lines);
        blocks.push(block);
    }

    let mut out = imports;
    for block in blocks {
        out.push(String::new());
        out.extend(block);
    }
    out
}

/// Replace the `ordinal`-th occurrence of `needle` across `lines`.
fn replace_nth(lines: &mut [String], needle: &str, ordinal: usize, replacement: &str) {
    let mut seen = 0;
    for line in lines.iter_mut() {
        let mut search_from = 0;
        while let Some(offset) = line[search_from..].find(needle) {
            let at = search_from + offset;
            if seen == ordinal {
                line.replace_range(at..at + needle.len(), replacement);
                return;
            }
            seen += 1;
            search_from = at + needle.len();
        }
    }
}

/// Transpile a step range into a flat script.
pub fn transpile(steps: &[Step], registry: &FunctionRegistry) -> String {
    if steps.is_empty() {
        return String::new();
    }
    let mut out = render(steps, registry, &[]).join("\n");
    out.push('\n');
    out
}

/// Transpile a step range into `function rerun_edits(...)` with the
/// selected literals lifted into parameters, plus a call site that
/// reproduces the original run.
pub fn parameterize(
    steps: &[Step],
    registry: &FunctionRegistry,
    selections: &[LiteralSelection],
) -> Result<ParameterizedCode, TranspileError> {
    if steps.is_empty() {
        return Err(TranspileError::EmptyStepRange);
    }

    let mut params: Vec<(LiteralSelection, String)> = Vec::new();
    let mut named: Vec<(String, String)> = Vec::new();
    for (counter, selection) in selections.iter().enumerate() {
        let step = steps.get(selection.step_index).ok_or(TranspileError::StepOutOfRange {
            index: selection.step_index,
            len: steps.len(),
        })?;
        let literals = step.parameterizable_literals();
        let literal =
            literals.get(selection.literal_index).ok_or(TranspileError::LiteralOutOfRange {
                step: selection.step_index,
                literal: selection.literal_index,
                available: literals.len(),
            })?;
        let name = format!("{}_{}", literal.suggested_name, counter);
        params.push((*selection, name.clone()));
        named.push((name, literal.code_text.clone()));
    }

    let body = render(steps, registry, &params);
    let signature: Vec<&str> = named.iter().map(|(name, _)| name.as_str()).collect();
    let mut function_source = format!("function rerun_edits({})\n", signature.join(", "));
    for line in &body {
        if line.is_empty() {
            function_source.push('\n');
        } else {
            function_source.push_str(TAB);
            function_source.push_str(line);
            function_source.push('\n');
        }
    }
    function_source.push_str("end");

    let args: Vec<&str> = named.iter().map(|(_, literal)| literal.as_str()).collect();
    let call_site = format!("rerun_edits({})", args.join(", "));

    Ok(ParameterizedCode { function_source, call_site, params: named })
}
