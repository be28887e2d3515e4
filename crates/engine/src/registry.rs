//! Seam to the external domain-function library.
//!
//! The engine never embeds domain-function logic: a transform step resolves
//! its function by name here, and the host registers both the Rust callable
//! (for step application) and the codegen metadata naming the runtime module
//! that implements the same function for replay.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StepError;
use crate::state::Column;

/// Argument passed to a registered function, both at apply time and in
/// generated code.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FnArg {
    None,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

pub type ColumnFn = Arc<dyn Fn(&Column, &FnArg) -> Result<Column, StepError> + Send + Sync>;

/// How to emit a call to a registered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenMeta {
    /// Import line the transpiler must emit, e.g. `local fns = require("tab_fns")`.
    pub import_line: String,
    /// Qualified callable name, e.g. `fns.fill_missing`.
    pub qualified_name: String,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, (ColumnFn, CodegenMeta)>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: ColumnFn, meta: CodegenMeta) {
        self.functions.insert(name.into(), (func, meta));
    }

    pub fn lookup(&self, name: &str) -> Option<(&ColumnFn, &CodegenMeta)> {
        self.functions.get(name).map(|(f, m)| (f, m))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CellValue, Dtype};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::new();
        registry.register(
            "negate",
            Arc::new(|col: &Column, _arg: &FnArg| {
                let mut out = col.clone();
                for v in &mut out.values {
                    if let CellValue::Int(n) = v {
                        *n = -*n;
                    }
                }
                Ok(out)
            }),
            CodegenMeta {
                import_line: "local fns = require(\"tab_fns\")".into(),
                qualified_name: "fns.negate".into(),
            },
        );

        let (func, meta) = registry.lookup("negate").expect("registered");
        assert_eq!(meta.qualified_name, "fns.negate");

        let col = Column::new("A", "A", Dtype::Int64, vec![CellValue::Int(3)]);
        let out = func(&col, &FnArg::None).unwrap();
        assert_eq!(out.values[0], CellValue::Int(-3));

        assert!(registry.lookup("missing").is_none());
    }
}
