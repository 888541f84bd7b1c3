//! x86-64 instruction decoding on top of `iced_x86`.

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter, Mnemonic};

/// How many bytes to fetch at the program counter when looking for the
/// instruction after a call: two maximum-length instructions.
pub const CALL_WINDOW: usize = 16 * 2;

const BITNESS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
}

fn formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    let options = formatter.options_mut();
    options.set_hex_prefix("0x");
    options.set_hex_suffix("");
    options.set_uppercase_hex(false);
    options.set_space_after_operand_separator(true);
    options.set_space_between_memory_add_operators(true);
    formatter
}

/// Decodes `bytes` as if they were mapped at `address`.
///
/// Decoding stops at the first byte sequence that is not a complete valid
/// instruction, including one cut off by the end of the buffer.
pub fn disassemble(bytes: &[u8], address: u64) -> Vec<DecodedInstruction> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, address, DecoderOptions::NONE);
    let mut formatter = formatter();
    let mut instructions = Vec::new();

    while decoder.can_decode() {
        let position = decoder.position();
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }

        let mut mnemonic = String::new();
        formatter.format_mnemonic(&instruction, &mut mnemonic);
        let mut operands = String::new();
        formatter.format_all_operands(&instruction, &mut operands);

        instructions.push(DecodedInstruction {
            address: instruction.ip(),
            bytes: bytes[position..position + instruction.len()].to_vec(),
            mnemonic,
            operands,
        });
    }

    instructions
}

/// If the instruction at `address` is a call, returns the address of the
/// instruction following it.
///
/// `None` when the first instruction is anything else, or when the buffer
/// does not hold a complete second instruction.
pub fn next_instruction_address_if_call(bytes: &[u8], address: u64) -> Option<u64> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, address, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let first = decoder.decode();
    if first.is_invalid() || first.mnemonic() != Mnemonic::Call {
        return None;
    }

    if !decoder.can_decode() {
        return None;
    }
    let second = decoder.decode();
    if second.is_invalid() {
        return None;
    }
    Some(second.ip())
}
