//! Per-build function catalogue.
//!
//! Everything the injector knows about a target build is data: for each
//! instrumented function a byte signature, the recorded opcode bytes of its
//! prologue, and named trigger/callback/patch templates. The catalogue is
//! shipped as JSON next to the controller and loaded at start-up; nothing
//! in here is computed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scan::Signature;

/// Default shadow-space reservation for triggers that call into the
/// target's own functions (Windows x64 calling convention).
pub const DEFAULT_TRIGGER_STACK: u32 = 0x28;

fn default_stack_size() -> u32 {
    DEFAULT_TRIGGER_STACK
}

fn default_returns() -> bool {
    true
}

/// A controller-invocable stub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub template: String,
    #[serde(default = "default_stack_size")]
    pub stack_size: u32,
    #[serde(default = "default_returns")]
    pub returns: bool,
}

/// A stub spliced into the function's own instruction stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSpec {
    /// Where inside the function the splice patch lands.
    #[serde(default)]
    pub offset: u64,
    pub template: String,
    /// Parameter cell the callback body writes its result into, if any.
    #[serde(default)]
    pub result_param: Option<String>,
}

/// A raw in-place overwrite with no splice-back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSpec {
    #[serde(default)]
    pub offset: u64,
    pub template: String,
}

/// One instrumented target function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameFunction {
    /// Stable code used in offsets caches, logs and errors.
    pub code: String,
    /// Scan signature locating the function in the module.
    pub signature: Signature,
    /// Recorded opcode bytes, one instruction per entry, as emitted by the
    /// disassembler the catalogue was built with.
    pub opcodes: Vec<String>,
    #[serde(default)]
    pub triggers: HashMap<String, TriggerSpec>,
    #[serde(default)]
    pub callbacks: HashMap<String, CallbackSpec>,
    #[serde(default)]
    pub patches: HashMap<String, PatchSpec>,
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err(Error::InvalidPattern(format!(
            "odd-length opcode string '{text}'"
        )));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|e| Error::InvalidPattern(format!("opcode byte '{text}': {e}")))
        })
        .collect()
}

impl GameFunction {
    /// Recorded instructions as raw bytes, one entry per instruction.
    pub fn opcode_bytes(&self) -> Result<Vec<Vec<u8>>> {
        self.opcodes.iter().map(|s| parse_hex_bytes(s)).collect()
    }

    /// Total recorded length, which bounds every in-place patch.
    pub fn byte_len(&self) -> Result<usize> {
        Ok(self.opcode_bytes()?.iter().map(|b| b.len()).sum())
    }
}

/// The whole per-build catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCatalog {
    /// Target build this catalogue was authored against.
    pub version: String,
    pub functions: HashMap<String, GameFunction>,
}

impl FunctionCatalog {
    pub fn function(&self, code: &str) -> Option<&GameFunction> {
        self.functions.get(code)
    }
}

pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<FunctionCatalog> {
    let content = fs::read_to_string(&path)?;
    let catalog = serde_json::from_str(&content)?;
    Ok(catalog)
}

pub fn save_catalog<P: AsRef<Path>>(path: P, catalog: &FunctionCatalog) -> Result<()> {
    let content = serde_json::to_string_pretty(catalog)?;
    fs::write(path, content)?;
    Ok(())
}
