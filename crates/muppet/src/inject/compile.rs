//! Stub builders: triggers, splice callbacks, raw patches.
//!
//! All three are pure byte producers; writing into the target is the
//! lifecycle's job. The callback builder is the delicate one: the spliced
//! stub must be register-transparent and must replay the instructions the
//! patch displaced, relocated to their new home, before jumping back.

use std::collections::HashMap;

use crate::asm;
use crate::error::{Error, Result};
use crate::inject::catalog::{CallbackSpec, GameFunction, PatchSpec, TriggerSpec};

/// Pointer-cell parameter every callback needs: where the stub caches the
/// interrupted thread's `rsp`.
pub const RSP_CACHE_PARAM: &str = "rsp_cache";

/// Compile a trigger stub: optional stack reservation around the rendered
/// body, `ret` unless the template flows elsewhere itself.
pub fn compile_trigger(spec: &TriggerSpec, params: &HashMap<String, u64>) -> Result<Vec<u8>> {
    let mut stubs: Vec<String> = vec!["start:".to_string()];

    if spec.stack_size != 0 {
        stubs.push(format!("sub rsp, {}", spec.stack_size));
    }

    stubs.push(asm::render(&spec.template, params)?);
    stubs.push("end:".to_string());

    if spec.stack_size != 0 {
        stubs.push(format!("add rsp, {}", spec.stack_size));
    }
    if spec.returns {
        stubs.push("ret".to_string());
    }

    asm::assemble(&stubs.join("\n"), 0)
}

/// The splice patch written over the function's first instructions.
fn patch_stub(callback_addr: u64) -> String {
    format!("mov r15, {callback_addr}\njmp r15")
}

/// Walk the recorded opcodes, accumulating whole instructions until they
/// cover `needed` bytes. Returns the covered length, which is the patch
/// span. Patching may only ever end on an instruction boundary.
pub fn patch_span(func: &GameFunction, needed: usize) -> Result<usize> {
    let mut covered = 0usize;
    for instruction in func.opcode_bytes()? {
        covered += instruction.len();
        if covered >= needed {
            return Ok(covered);
        }
    }
    Err(Error::AssemblyFailed {
        line: func.code.clone(),
        message: format!(
            "recorded opcodes cover {covered} bytes, patch needs {needed}"
        ),
    })
}

/// Byte span the splice patch for `callback_addr` will occupy inside the
/// function, nop padding included.
pub fn callback_patch_span(func: &GameFunction, callback_addr: u64) -> Result<usize> {
    let raw = asm::assemble(&patch_stub(callback_addr), 0)?;
    patch_span(func, raw.len())
}

/// Compiled splice artifacts.
#[derive(Debug, Clone)]
pub struct CompiledCallback {
    /// Bytes written at `func_addr + offset`; exactly `span` long.
    pub patch_bytes: Vec<u8>,
    /// Bytes written into the callback slot.
    pub callback_bytes: Vec<u8>,
}

/// Compile a callback stub and its splice patch.
///
/// `original` must hold the bytes currently at `func_addr + spec.offset`
/// for the full patch span; they are both the rollback payload and the
/// instructions the stub replays.
///
/// Stub shape: push all GPRs, cache `rsp` into the dedicated cell, run the
/// template body, restore `rsp`, pop everything in exact inverse order,
/// replay the relocated originals, jump back past the patched region.
pub fn compile_callback(
    func: &GameFunction,
    spec: &CallbackSpec,
    callback_addr: u64,
    func_addr: u64,
    params: &HashMap<String, u64>,
    original: &[u8],
) -> Result<CompiledCallback> {
    if !params.contains_key(RSP_CACHE_PARAM) {
        return Err(Error::MissingTemplateParam(RSP_CACHE_PARAM.to_string()));
    }

    let raw_patch = asm::assemble(&patch_stub(callback_addr), 0)?;
    let span = patch_span(func, raw_patch.len())?;
    if original.len() != span {
        return Err(Error::AssemblyFailed {
            line: func.code.clone(),
            message: format!(
                "original byte span mismatch: got {}, patch covers {}",
                original.len(),
                span
            ),
        });
    }

    let mut patch_bytes = raw_patch;
    patch_bytes.extend(asm::nops(span - patch_bytes.len()));

    let head_text = [
        "cache_registers:",
        "   push rax",
        "   push rbx",
        "   push rcx",
        "   push rdx",
        "   push rsi",
        "   push rdi",
        "   push rbp",
        "   push r8",
        "   push r9",
        "   push r10",
        "   push r11",
        "   push r12",
        "   push r13",
        "   push r14",
        "   push r15",
        "   mov r15, {rsp_cache}",
        "   mov [r15], rsp",
        spec.template.as_str(),
        "restore_registers:",
        "    mov r15, {rsp_cache}",
        "    mov rsp, [r15]",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop r11",
        "    pop r10",
        "    pop r9",
        "    pop r8",
        "    pop rbp",
        "    pop rdi",
        "    pop rsi",
        "    pop rdx",
        "    pop rcx",
        "    pop rbx",
        "    pop rax",
    ]
    .join("\n");

    let mut callback_bytes = asm::assemble(&asm::render(&head_text, params)?, callback_addr)?;

    // replay the displaced instructions where they now live
    let replay_at = callback_addr + callback_bytes.len() as u64;
    callback_bytes.extend(asm::relocate(original, func_addr + spec.offset, replay_at)?);

    // resume past the patched region
    let resume = func_addr + spec.offset + span as u64;
    callback_bytes.extend(asm::assemble(
        &format!("mov r15, {resume}\njmp r15"),
        callback_addr + callback_bytes.len() as u64,
    )?);

    Ok(CompiledCallback {
        patch_bytes,
        callback_bytes,
    })
}

/// Compile a raw patch: rendered template padded with `nop` to the full
/// recorded opcode length, so no trailing original bytes stay live.
pub fn compile_patch(
    func: &GameFunction,
    spec: &PatchSpec,
    params: &HashMap<String, u64>,
) -> Result<Vec<u8>> {
    let mut bytes = asm::assemble(&asm::render(&spec.template, params)?, 0)?;
    let span = func.byte_len()?;

    if bytes.len() > span {
        return Err(Error::AssemblyFailed {
            line: func.code.clone(),
            message: format!(
                "patch is {} bytes but the function's recorded opcodes cover {span}",
                bytes.len()
            ),
        });
    }

    bytes.extend(asm::nops(span - bytes.len()));
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Signature;
    use std::collections::HashMap;

    fn params(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn sample_function() -> GameFunction {
        GameFunction {
            code: "player_move".to_string(),
            signature: Signature::parse("48 83 EC 28").unwrap(),
            opcodes: vec![
                // sub rsp, 0x28
                "48 83 EC 28".to_string(),
                // mov rax, [rip+0x10]
                "48 8B 05 10 00 00 00".to_string(),
                // mov [rsp+0x20], rax
                "48 89 44 24 20".to_string(),
            ],
            triggers: HashMap::new(),
            callbacks: HashMap::new(),
            patches: HashMap::new(),
        }
    }

    #[test]
    fn trigger_wraps_body_in_stack_frame_and_ret() {
        let spec = TriggerSpec {
            template: "mov rax, {game_func}\ncall rax".to_string(),
            stack_size: 0x28,
            returns: true,
        };
        let bytes = compile_trigger(&spec, &params(&[("game_func", 0x1234)])).unwrap();

        // sub rsp, 0x28
        assert_eq!(&bytes[..4], &[0x48, 0x83, 0xEC, 0x28]);
        // ends with add rsp, 0x28 ; ret
        let n = bytes.len();
        assert_eq!(&bytes[n - 5..], &[0x48, 0x83, 0xC4, 0x28, 0xC3]);
    }

    #[test]
    fn trigger_without_return_or_stack() {
        let spec = TriggerSpec {
            template: "mov rax, 1".to_string(),
            stack_size: 0,
            returns: false,
        };
        let bytes = compile_trigger(&spec, &params(&[])).unwrap();
        assert!(!bytes.starts_with(&[0x48, 0x83, 0xEC]));
        assert_ne!(*bytes.last().unwrap(), 0xC3);
    }

    #[test]
    fn patch_span_lands_on_instruction_boundaries() {
        let func = sample_function();
        // 13-byte splice needs 4 + 7 + 5 = 16 bytes of cover
        assert_eq!(patch_span(&func, 13).unwrap(), 16);
        // a 4-byte need is covered by the first instruction alone
        assert_eq!(patch_span(&func, 4).unwrap(), 4);
        // more than the function records is an error
        assert!(patch_span(&func, 64).is_err());
    }

    #[test]
    fn callback_patch_is_padded_to_span() {
        let func = sample_function();
        let callback_addr = 0x7FF0_0000u64;
        let span = callback_patch_span(&func, callback_addr).unwrap();
        assert_eq!(span, 16);

        let original = vec![
            0x48, 0x83, 0xEC, 0x28, //
            0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, //
            0x48, 0x89, 0x44, 0x24, 0x20,
        ];
        let spec = CallbackSpec {
            offset: 0,
            template: "mov r15, {ptr_result}\nmov [r15], rcx".to_string(),
            result_param: Some("ptr_result".to_string()),
        };
        let compiled = compile_callback(
            &func,
            &spec,
            callback_addr,
            0x1400_0000,
            &params(&[("rsp_cache", 0x9000), ("ptr_result", 0x9008)]),
            &original,
        )
        .unwrap();

        assert_eq!(compiled.patch_bytes.len(), span);
        // splice starts with mov r15, imm64
        assert_eq!(&compiled.patch_bytes[..2], &[0x49, 0xBF]);
        // padding is nop, never original bytes
        assert_eq!(compiled.patch_bytes[span - 3..], [0x90, 0x90, 0x90]);
    }

    #[test]
    fn callback_preserves_and_replays() {
        let func = sample_function();
        let original = vec![
            0x48, 0x83, 0xEC, 0x28, //
            0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, //
            0x48, 0x89, 0x44, 0x24, 0x20,
        ];
        let spec = CallbackSpec {
            offset: 0,
            template: "nop".to_string(),
            result_param: None,
        };
        let compiled = compile_callback(
            &func,
            &spec,
            0x7FF0_0000,
            0x1400_0000,
            &params(&[("rsp_cache", 0x9000)]),
            &original,
        )
        .unwrap();

        let bytes = &compiled.callback_bytes;
        // opens with push rax
        assert_eq!(bytes[0], 0x50);
        // the relocated `sub rsp, 0x28` is replayed verbatim somewhere
        // after the pops (it has no rip dependence)
        let needle = [0x48u8, 0x83, 0xEC, 0x28];
        assert!(bytes.windows(4).any(|w| w == needle));
        // ends with jmp r15
        assert_eq!(&bytes[bytes.len() - 3..], &[0x41, 0xFF, 0xE7]);
    }

    #[test]
    fn callback_requires_rsp_cache_param() {
        let func = sample_function();
        let spec = CallbackSpec {
            offset: 0,
            template: "nop".to_string(),
            result_param: None,
        };
        let err = compile_callback(&func, &spec, 0x7000, 0x1000, &params(&[]), &[]).unwrap_err();
        assert!(matches!(err, Error::MissingTemplateParam(_)));
    }

    #[test]
    fn patch_pads_to_full_recorded_length() {
        let func = sample_function();
        let spec = PatchSpec {
            offset: 0,
            template: "xor rax, rax\nret".to_string(),
        };
        let bytes = compile_patch(&func, &spec, &params(&[])).unwrap();
        assert_eq!(bytes.len(), func.byte_len().unwrap());
        // tail is nop padding
        assert_eq!(*bytes.last().unwrap(), 0x90);
    }

    #[test]
    fn oversized_patch_is_rejected() {
        let mut func = sample_function();
        func.opcodes = vec!["90".to_string()];
        let spec = PatchSpec {
            offset: 0,
            template: "mov rax, 0x1122334455667788".to_string(),
        };
        assert!(compile_patch(&func, &spec, &params(&[])).is_err());
    }
}
