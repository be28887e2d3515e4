use serde::{Deserialize, Serialize};

/// Version of the runtime table library the generated code will run against.
/// Ordered by (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Pattern substitution on duration columns needs at least this runtime.
pub const MIN_DURATION_REPLACE: RuntimeVersion = RuntimeVersion::new(1, 4);

/// The version this engine ships against.
pub const CURRENT_RUNTIME: RuntimeVersion = RuntimeVersion::new(1, 6);

/// What the host environment's runtime can do. Checked at step application
/// so unsupported edits fail with a typed error instead of broken code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCapabilities {
    pub version: RuntimeVersion,
}

impl Default for RuntimeCapabilities {
    fn default() -> Self {
        Self { version: CURRENT_RUNTIME }
    }
}
