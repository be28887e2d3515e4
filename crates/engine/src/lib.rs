pub mod caps;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod state;
pub mod step;
pub mod transpiler;

pub use caps::{RuntimeCapabilities, RuntimeVersion};
pub use error::{ExecutionError, StepError, TranspileError};
pub use manager::StepsManager;
pub use state::{CellValue, Column, Dtype, HeaderFormat, Table, TableState};
pub use step::{Step, StepKind};
