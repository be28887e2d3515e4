use std::fmt;

use crate::caps::RuntimeVersion;
use crate::state::Dtype;

/// Why a step could not be applied. The log is untouched when any of these
/// surface; the caller gets enough context to display to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// The step references something that does not exist in its prev state,
    /// or its parameters are malformed (bad pattern, ragged columns, ...).
    InvalidStep { step: &'static str, detail: String },
    /// The edit is not representable for a column's type.
    TypeConversion { table: String, column: String, dtype: Dtype, value: String },
    /// The runtime library is too old for this edit on this column type.
    CapabilityVersion {
        operation: &'static str,
        dtype: Dtype,
        minimum: RuntimeVersion,
        current: RuntimeVersion,
    },
}

impl StepError {
    pub fn missing_table(step: &'static str, table: &str) -> Self {
        Self::InvalidStep { step, detail: format!("table '{}' does not exist", table) }
    }

    pub fn missing_column(step: &'static str, table: &str, column: &str) -> Self {
        Self::InvalidStep {
            step,
            detail: format!("table '{}' has no column '{}'", table, column),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStep { step, detail } => write!(f, "{}: {}", step, detail),
            Self::TypeConversion { table, column, dtype, value } => write!(
                f,
                "table '{}', column '{}': cannot convert '{}' back to {}",
                table, column, value, dtype
            ),
            Self::CapabilityVersion { operation, dtype, minimum, current } => write!(
                f,
                "{} on {} columns requires runtime {} or later (current: {})",
                operation, dtype, minimum, current
            ),
        }
    }
}

impl std::error::Error for StepError {}

/// Fatal for one code-generation request; never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranspileError {
    EmptyStepRange,
    StepOutOfRange { index: usize, len: usize },
    LiteralOutOfRange { step: usize, literal: usize, available: usize },
}

impl fmt::Display for TranspileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyStepRange => write!(f, "cannot transpile an empty step range"),
            Self::StepOutOfRange { index, len } => {
                write!(f, "step index {} out of range (active steps: {})", index, len)
            }
            Self::LiteralOutOfRange { step, literal, available } => write!(
                f,
                "step {} has {} parameterizable literal(s), index {} out of range",
                step, available, literal
            ),
        }
    }
}

impl std::error::Error for TranspileError {}

/// Generated or replayed code failed to run in the sandbox. Carries whatever
/// output was captured before the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub message: String,
    pub output: String,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed: {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}
