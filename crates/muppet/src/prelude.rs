//! Convenience re-exports for downstream crates.

pub use crate::arena::{MemoryArena, SlotPurpose};
pub use crate::call::CallCell;
pub use crate::clr::{ClrReader, PointerWidth};
pub use crate::engine::{Engine, EngineConfig};
pub use crate::error::{Error, Result};
pub use crate::inject::{FunctionCatalog, GameFunction, InjectionSet};
pub use crate::process::ProcessMemory;
pub use crate::scan::{ScanOptions, Signature};
