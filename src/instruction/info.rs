//! Operand layout metadata and a best-effort disassembler. Nothing here
//! affects execution; the interpreter reads operands through the opcode
//! handlers. This exists for trace logs and frame debug dumps.

use byteorder::{BigEndian, ByteOrder};

use crate::instruction::Opcode;

/// How an instruction's operand bytes are laid out after the opcode byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandLayout {
    OpcodeOnly,
    ConstantPool,
    ConstantPoolUint8,
    ConstantPoolAndUint8Value,
    Uint8Value,
    Uint8AndInt8Value,
    Int8Value,
    Int16Value,
    Int32Value,
    ArrayType,
    Wide,
}

impl Opcode {
    pub fn layout(self) -> OperandLayout {
        use Opcode::*;
        match self {
            ldc => OperandLayout::ConstantPoolUint8,
            ldc_w | ldc2_w | getstatic | putstatic | getfield | putfield | invokevirtual
            | invokespecial | invokestatic | new | anewarray | checkcast | instanceof
            | invokevirtual_fast | invokespecial_fast | invokestatic_fast | invokehandle
            | invokebasic | linktospecial | linktostatic | linktovirtual | linktointerface => {
                OperandLayout::ConstantPool
            }
            invokeinterface | invokeinterface_fast | invokedynamic | multianewarray => {
                OperandLayout::ConstantPoolAndUint8Value
            }
            iload | lload | fload | dload | aload | istore | lstore | fstore | dstore
            | astore | ret => OperandLayout::Uint8Value,
            iinc => OperandLayout::Uint8AndInt8Value,
            bipush => OperandLayout::Int8Value,
            sipush | ifeq | ifne | iflt | ifge | ifgt | ifle | if_icmpeq | if_icmpne
            | if_icmplt | if_icmpge | if_icmpgt | if_icmple | if_acmpeq | if_acmpne | goto
            | jsr | ifnull | ifnonnull => OperandLayout::Int16Value,
            goto_w | jsr_w => OperandLayout::Int32Value,
            newarray => OperandLayout::ArrayType,
            wide => OperandLayout::Wide,
            _ => OperandLayout::OpcodeOnly,
        }
    }
}

fn array_type_name(atype: u8) -> &'static str {
    match atype {
        4 => "boolean",
        5 => "char",
        6 => "float",
        7 => "double",
        8 => "byte",
        9 => "short",
        10 => "int",
        11 => "long",
        _ => "unknown",
    }
}

/// Render `(pc, text)` rows for a code buffer. Decoding is forgiving: an
/// unknown opcode byte is emitted as raw data, and a truncated tail stops
/// the listing.
pub fn disassemble(code: &[u8]) -> Vec<(u32, String)> {
    let mut rows = Vec::new();
    let mut pc = 0usize;

    while pc < code.len() {
        let op = match Opcode::from_byte(code[pc]) {
            Some(op) => op,
            None => {
                rows.push((pc as u32, format!(".byte {:#04x}", code[pc])));
                pc += 1;
                continue;
            }
        };

        let (text, width) = match op.layout() {
            OperandLayout::OpcodeOnly => match op {
                Opcode::tableswitch => match decode_tableswitch(code, pc) {
                    Some(v) => v,
                    None => break,
                },
                Opcode::lookupswitch => match decode_lookupswitch(code, pc) {
                    Some(v) => v,
                    None => break,
                },
                _ => (format!("{:?}", op), 1),
            },
            OperandLayout::ConstantPool => {
                if pc + 3 > code.len() {
                    break;
                }
                let index = BigEndian::read_u16(&code[pc + 1..]);
                (format!("{:?} #{}", op, index), 3)
            }
            OperandLayout::ConstantPoolUint8 => {
                if pc + 2 > code.len() {
                    break;
                }
                (format!("{:?} #{}", op, code[pc + 1]), 2)
            }
            OperandLayout::ConstantPoolAndUint8Value => {
                if pc + 4 > code.len() {
                    break;
                }
                let index = BigEndian::read_u16(&code[pc + 1..]);
                let value = code[pc + 3];
                let width = match op {
                    Opcode::multianewarray => 4,
                    _ => 5,
                };
                if pc + width > code.len() {
                    break;
                }
                (format!("{:?} #{} {}", op, index, value), width)
            }
            OperandLayout::Uint8Value => {
                if pc + 2 > code.len() {
                    break;
                }
                (format!("{:?} {}", op, code[pc + 1]), 2)
            }
            OperandLayout::Uint8AndInt8Value => {
                if pc + 3 > code.len() {
                    break;
                }
                (
                    format!("{:?} {} by {}", op, code[pc + 1], code[pc + 2] as i8),
                    3,
                )
            }
            OperandLayout::Int8Value => {
                if pc + 2 > code.len() {
                    break;
                }
                (format!("{:?} {}", op, code[pc + 1] as i8), 2)
            }
            OperandLayout::Int16Value => {
                if pc + 3 > code.len() {
                    break;
                }
                let value = BigEndian::read_i16(&code[pc + 1..]);
                let text = if matches!(op, Opcode::sipush) {
                    format!("{:?} {}", op, value)
                } else {
                    format!("{:?} {}", op, pc as i64 + value as i64)
                };
                (text, 3)
            }
            OperandLayout::Int32Value => {
                if pc + 5 > code.len() {
                    break;
                }
                let value = BigEndian::read_i32(&code[pc + 1..]);
                (format!("{:?} {}", op, pc as i64 + value as i64), 5)
            }
            OperandLayout::ArrayType => {
                if pc + 2 > code.len() {
                    break;
                }
                (format!("{:?} {}", op, array_type_name(code[pc + 1])), 2)
            }
            OperandLayout::Wide => match decode_wide(code, pc) {
                Some(v) => v,
                None => break,
            },
        };

        rows.push((pc as u32, text));
        pc += width;
    }

    rows
}

fn decode_wide(code: &[u8], pc: usize) -> Option<(String, usize)> {
    let modified = Opcode::from_byte(*code.get(pc + 1)?)?;
    if pc + 4 > code.len() {
        return None;
    }
    let index = BigEndian::read_u16(&code[pc + 2..]);

    if modified == Opcode::iinc {
        if pc + 6 > code.len() {
            return None;
        }
        let value = BigEndian::read_i16(&code[pc + 4..]);
        Some((format!("wide iinc {} by {}", index, value), 6))
    } else {
        Some((format!("wide {:?} {}", modified, index), 4))
    }
}

fn decode_tableswitch(code: &[u8], pc: usize) -> Option<(String, usize)> {
    let pad = (4 - (pc + 1) % 4) % 4;
    let base = pc + 1 + pad;
    if base + 12 > code.len() {
        return None;
    }

    let default = BigEndian::read_i32(&code[base..]);
    let low = BigEndian::read_i32(&code[base + 4..]);
    let high = BigEndian::read_i32(&code[base + 8..]);
    let entries = (high as i64 - low as i64 + 1).max(0) as usize;
    let width = base + 12 + entries * 4 - pc;
    if pc + width > code.len() {
        return None;
    }

    Some((
        format!(
            "tableswitch [{}..{}] default {}",
            low,
            high,
            pc as i64 + default as i64
        ),
        width,
    ))
}

fn decode_lookupswitch(code: &[u8], pc: usize) -> Option<(String, usize)> {
    let pad = (4 - (pc + 1) % 4) % 4;
    let base = pc + 1 + pad;
    if base + 8 > code.len() {
        return None;
    }

    let default = BigEndian::read_i32(&code[base..]);
    let npairs = BigEndian::read_i32(&code[base + 4..]).max(0) as usize;
    let width = base + 8 + npairs * 8 - pc;
    if pc + width > code.len() {
        return None;
    }

    Some((
        format!(
            "lookupswitch {} pairs default {}",
            npairs,
            pc as i64 + default as i64
        ),
        width,
    ))
}
