//! Stub assembly and code relocation.
//!
//! Stub templates are plain text in a deliberately small x86-64 dialect:
//! one instruction per line, `{name}` placeholders substituted with
//! resolved addresses before encoding, labels allowed as markers. The
//! dialect covers exactly what injected stubs need (register moves,
//! memory moves through a base register, stack adjustment, push/pop,
//! call/jmp through a register) and nothing else, so a typo in a
//! catalogue template fails loudly at compile time instead of emitting
//! garbage into the target.
//!
//! Relocation decodes displaced instructions and rewrites RIP-relative
//! memory operands onto `r15`, because the copy no longer executes at the
//! address the displacement was computed against.

use std::collections::HashMap;

use iced_x86::{Code, Decoder, DecoderOptions, Encoder, Instruction, MemoryOperand, Register};

use crate::error::{Error, Result};

/// Substitute `{name}` placeholders with parameter values (rendered as
/// decimal, the way the stub dialect reads immediates). `{{` and `}}`
/// escape literal braces.
pub fn render(template: &str, params: &HashMap<String, u64>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(Error::MissingTemplateParam(name)),
                    }
                }
                let value = params
                    .get(&name)
                    .ok_or_else(|| Error::MissingTemplateParam(name.clone()))?;
                out.push_str(&value.to_string());
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Reg(Register),
    Imm(i128),
    Mem { base: Register, disp: i64 },
}

fn parse_register(token: &str) -> Option<Register> {
    Some(match token {
        "rax" => Register::RAX,
        "rbx" => Register::RBX,
        "rcx" => Register::RCX,
        "rdx" => Register::RDX,
        "rsi" => Register::RSI,
        "rdi" => Register::RDI,
        "rbp" => Register::RBP,
        "rsp" => Register::RSP,
        "r8" => Register::R8,
        "r9" => Register::R9,
        "r10" => Register::R10,
        "r11" => Register::R11,
        "r12" => Register::R12,
        "r13" => Register::R13,
        "r14" => Register::R14,
        "r15" => Register::R15,
        _ => return None,
    })
}

fn parse_immediate(token: &str) -> Option<i128> {
    let (negative, token) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        token.parse::<i128>().ok()?
    };
    Some(if negative { -value } else { value })
}

fn parse_operand(token: &str) -> Option<Operand> {
    let token = token.trim();

    if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let inner: String = inner.chars().filter(|c| !c.is_whitespace()).collect();
        // split into base register and optional signed displacement
        let (base_str, disp) = if let Some(pos) = inner[1..].find(['+', '-']) {
            let split = pos + 1;
            let sign = if inner.as_bytes()[split] == b'-' { -1i64 } else { 1 };
            let disp = parse_immediate(&inner[split + 1..])? as i64;
            (&inner[..split], sign * disp)
        } else {
            (inner.as_str(), 0)
        };
        return Some(Operand::Mem {
            base: parse_register(base_str)?,
            disp,
        });
    }

    if let Some(reg) = parse_register(token) {
        return Some(Operand::Reg(reg));
    }
    parse_immediate(token).map(Operand::Imm)
}

fn asm_error(line: &str, message: impl Into<String>) -> Error {
    Error::AssemblyFailed {
        line: line.to_string(),
        message: message.into(),
    }
}

fn fits_i8(value: i128) -> bool {
    i8::try_from(value).is_ok()
}

fn fits_i32(value: i128) -> bool {
    i32::try_from(value).is_ok()
}

/// Build the iced instruction for one parsed line.
fn build_instruction(line: &str, mnemonic: &str, operands: &[Operand]) -> Result<Instruction> {
    let unsupported = || asm_error(line, format!("unsupported operands for '{mnemonic}'"));
    let iced = |e: iced_x86::IcedError| asm_error(line, e.to_string());

    let instruction = match (mnemonic, operands) {
        ("ret", []) => Instruction::with(Code::Retnq),
        ("push", [Operand::Reg(r)]) => Instruction::with1(Code::Push_r64, *r).map_err(iced)?,
        ("pop", [Operand::Reg(r)]) => Instruction::with1(Code::Pop_r64, *r).map_err(iced)?,
        ("call", [Operand::Reg(r)]) => Instruction::with1(Code::Call_rm64, *r).map_err(iced)?,
        ("jmp", [Operand::Reg(r)]) => Instruction::with1(Code::Jmp_rm64, *r).map_err(iced)?,

        ("mov", [Operand::Reg(dst), Operand::Imm(imm)]) => {
            if *imm < i64::MIN as i128 || *imm > u64::MAX as i128 {
                return Err(asm_error(line, "immediate out of 64-bit range"));
            }
            Instruction::with2(Code::Mov_r64_imm64, *dst, *imm as u64).map_err(iced)?
        }
        ("mov", [Operand::Reg(dst), Operand::Reg(src)]) => {
            Instruction::with2(Code::Mov_r64_rm64, *dst, *src).map_err(iced)?
        }
        ("mov", [Operand::Reg(dst), Operand::Mem { base, disp }]) => Instruction::with2(
            Code::Mov_r64_rm64,
            *dst,
            MemoryOperand::with_base_displ(*base, *disp),
        )
        .map_err(iced)?,
        ("mov", [Operand::Mem { base, disp }, Operand::Reg(src)]) => Instruction::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(*base, *disp),
            *src,
        )
        .map_err(iced)?,
        ("mov", [Operand::Mem { base, disp }, Operand::Imm(imm)]) => {
            if !fits_i32(*imm) {
                return Err(asm_error(line, "memory store immediate must fit in 32 bits"));
            }
            Instruction::with2(
                Code::Mov_rm64_imm32,
                MemoryOperand::with_base_displ(*base, *disp),
                *imm as i32,
            )
            .map_err(iced)?
        }

        ("add" | "sub" | "cmp", [Operand::Reg(dst), Operand::Imm(imm)]) => {
            if !fits_i32(*imm) {
                return Err(asm_error(line, "immediate must fit in 32 bits"));
            }
            let code = match (mnemonic, fits_i8(*imm)) {
                ("add", true) => Code::Add_rm64_imm8,
                ("add", false) => Code::Add_rm64_imm32,
                ("sub", true) => Code::Sub_rm64_imm8,
                ("sub", false) => Code::Sub_rm64_imm32,
                ("cmp", true) => Code::Cmp_rm64_imm8,
                (_, false) => Code::Cmp_rm64_imm32,
                _ => unreachable!(),
            };
            Instruction::with2(code, *dst, *imm as i32).map_err(iced)?
        }

        ("xor", [Operand::Reg(dst), Operand::Reg(src)]) => {
            Instruction::with2(Code::Xor_r64_rm64, *dst, *src).map_err(iced)?
        }
        ("test", [Operand::Reg(dst), Operand::Reg(src)]) => {
            Instruction::with2(Code::Test_rm64_r64, *dst, *src).map_err(iced)?
        }

        _ => return Err(unsupported()),
    };

    Ok(instruction)
}

/// Assemble template text into bytes. `base` is the address the code will
/// run at; the dialect has no IP-relative forms, so it only matters for
/// diagnostics, but it keeps the call shape of the relocating encoder.
pub fn assemble(text: &str, base: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = Encoder::new(64);

    for raw_line in text.lines() {
        let line = match raw_line.find(';') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }
        // labels are markers only; nothing in the dialect branches to them
        if line.ends_with(':') {
            continue;
        }

        let lowered = line.to_ascii_lowercase();
        let (mnemonic, rest) = match lowered.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (lowered.as_str(), ""),
        };

        if mnemonic == "nop" {
            out.push(0x90);
            continue;
        }

        let operands: Vec<Operand> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',')
                .map(|t| parse_operand(t).ok_or_else(|| asm_error(line, "unparsable operand")))
                .collect::<Result<_>>()?
        };

        let instruction = build_instruction(line, mnemonic, &operands)?;
        encoder
            .encode(&instruction, base + out.len() as u64)
            .map_err(|e| asm_error(line, e.to_string()))?;
        out.extend_from_slice(&encoder.take_buffer());
    }

    Ok(out)
}

/// Single-byte NOP padding.
pub fn nops(count: usize) -> Vec<u8> {
    vec![0x90; count]
}

/// Re-encode instructions lifted from `original_ip` so they can run at
/// `new_ip`.
///
/// Instructions addressing memory through RIP are rewritten as a scratch
/// load (`mov r15, <address after the original instruction>`) with the
/// operand rebased onto `r15` and its raw displacement kept, which lands on
/// the same absolute address no matter where the copy runs. Near branches
/// keep their absolute target; the encoder recomputes the displacement for
/// the new address and fails if the distance no longer fits.
pub fn relocate(bytes: &[u8], original_ip: u64, new_ip: u64) -> Result<Vec<u8>> {
    let mut decoder = Decoder::with_ip(64, bytes, original_ip, DecoderOptions::NONE);
    let mut out = Vec::new();
    let mut encoder = Encoder::new(64);

    let mut encode = |instruction: &Instruction, at: u64, encoder: &mut Encoder| -> Result<usize> {
        encoder
            .encode(instruction, at)
            .map_err(|e| Error::AssemblyFailed {
                line: format!("{instruction}"),
                message: e.to_string(),
            })
    };

    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::AssemblyFailed {
                line: format!("{:02X?}", bytes),
                message: format!("undecodable bytes at {:#x}", instruction.ip()),
            });
        }

        if instruction.is_ip_rel_memory_operand() {
            let next_ip = instruction.next_ip();
            let target = instruction.ip_rel_memory_address();

            let load =
                Instruction::with2(Code::Mov_r64_imm64, Register::R15, next_ip).map_err(|e| {
                    Error::AssemblyFailed {
                        line: format!("{instruction}"),
                        message: e.to_string(),
                    }
                })?;
            encode(&load, new_ip + out.len() as u64, &mut encoder)?;
            out.extend_from_slice(&encoder.take_buffer());

            let mut rebased = instruction;
            rebased.set_memory_base(Register::R15);
            // keep the raw disp32; r15 carries what RIP would have held
            rebased.set_memory_displacement64(target.wrapping_sub(next_ip));
            rebased.set_memory_displ_size(4);
            encode(&rebased, new_ip + out.len() as u64, &mut encoder)?;
            out.extend_from_slice(&encoder.take_buffer());
        } else {
            encode(&instruction, new_ip + out.len() as u64, &mut encoder)?;
            out.extend_from_slice(&encoder.take_buffer());
        }
    }

    Ok(out)
}
