//! Process instrumentation core for a Unity-based MMO client.
//!
//! The target exposes no symbols and no IPC surface; everything here works
//! against raw process memory:
//!
//! - [`scan`] locates functions by byte signature in files or live memory
//! - [`module`] resolves exports by walking PE headers
//! - [`arena`] tracks scratch allocations inside the target
//! - [`asm`] assembles stub templates and relocates displaced code
//! - [`inject`] installs and rolls back triggers, callbacks and patches
//! - [`call`] is the busy-wait handshake used to run injected triggers
//! - [`clr`] decodes the managed runtime's collections and strings
//!
//! The process boundary is the [`process::ProcessMemory`] trait; everything
//! above it is platform-neutral and testable against an in-memory mock.

pub mod arena;
pub mod asm;
pub mod call;
pub mod clr;
pub mod engine;
mod error;
pub mod inject;
pub mod module;
pub mod offset;
pub mod prelude;
pub mod process;
pub mod scan;

pub use error::{Error, Result};
