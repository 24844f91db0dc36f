use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use super::VmError;

/// Compiled Daedalus opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Or = 5,
    AndB = 6,
    Lt = 7,
    Gt = 8,
    MovI = 9,
    LogOr = 11,
    LogAnd = 12,
    Shl = 13,
    Shr = 14,
    Lte = 15,
    Eq = 16,
    Neq = 17,
    Gte = 18,
    AddMovI = 19,
    SubMovI = 20,
    MulMovI = 21,
    DivMovI = 22,
    Plus = 30,
    Negate = 31,
    Not = 32,
    Cmpl = 33,
    Nop = 45,
    Rsr = 60,
    Bl = 61,
    Be = 62,
    PushI = 64,
    PushV = 65,
    PushVI = 67,
    MovS = 70,
    MovSS = 71,
    MovVF = 72,
    MovF = 73,
    MovVI = 74,
    B = 75,
    Bz = 76,
    GMovI = 80,
    PushVV = 245,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match v {
            0 => Add,
            1 => Sub,
            2 => Mul,
            3 => Div,
            4 => Mod,
            5 => Or,
            6 => AndB,
            7 => Lt,
            8 => Gt,
            9 => MovI,
            11 => LogOr,
            12 => LogAnd,
            13 => Shl,
            14 => Shr,
            15 => Lte,
            16 => Eq,
            17 => Neq,
            18 => Gte,
            19 => AddMovI,
            20 => SubMovI,
            21 => MulMovI,
            22 => DivMovI,
            30 => Plus,
            31 => Negate,
            32 => Not,
            33 => Cmpl,
            45 => Nop,
            60 => Rsr,
            61 => Bl,
            62 => Be,
            64 => PushI,
            65 => PushV,
            67 => PushVI,
            70 => MovS,
            71 => MovSS,
            72 => MovVF,
            73 => MovF,
            74 => MovVI,
            75 => B,
            76 => Bz,
            80 => GMovI,
            245 => PushVV,
            other => return Err(other),
        })
    }
}

impl Opcode {
    /// Encoded size including operands.
    pub fn size(self) -> u32 {
        match self {
            Opcode::Bl
            | Opcode::Be
            | Opcode::PushI
            | Opcode::PushV
            | Opcode::PushVI
            | Opcode::B
            | Opcode::Bz
            | Opcode::GMovI => 5,
            Opcode::PushVV => 6,
            _ => 1,
        }
    }

    /// Two operands in, one result out.
    pub fn is_binary(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Add | Sub | Mul | Div | Mod | Or | AndB | Lt | Gt | LogOr | LogAnd | Shl | Shr | Lte | Eq | Neq | Gte
        )
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Opcode::Plus | Opcode::Negate | Opcode::Not | Opcode::Cmpl)
    }

    pub fn is_push(self) -> bool {
        matches!(self, Opcode::PushI | Opcode::PushV | Opcode::PushVI | Opcode::PushVV)
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Or => "or",
            AndB => "andb",
            Lt => "lt",
            Gt => "gt",
            MovI => "movi",
            LogOr => "orr",
            LogAnd => "andr",
            Shl => "lsl",
            Shr => "lsr",
            Lte => "lte",
            Eq => "eq",
            Neq => "neq",
            Gte => "gte",
            AddMovI => "addmovi",
            SubMovI => "submovi",
            MulMovI => "mulmovi",
            DivMovI => "divmovi",
            Plus => "plus",
            Negate => "negate",
            Not => "not",
            Cmpl => "cmpl",
            Nop => "nop",
            Rsr => "rsr",
            Bl => "bl",
            Be => "be",
            PushI => "pushi",
            PushV => "pushv",
            PushVI => "pushvi",
            MovS => "movs",
            MovSS => "movss",
            MovVF => "movvf",
            MovF => "movf",
            MovVI => "movvi",
            B => "b",
            Bz => "bz",
            GMovI => "gmovi",
            PushVV => "pushvv",
        }
    }
}

/// One decoded instruction.
///
/// `operand` is the address for branches and `bl`, the symbol index for
/// `be`/`pushv`/`pushvi`/`pushvv`/`gmovi`, and the immediate for `pushi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: u32,
    pub op: Opcode,
    pub operand: u32,
    pub index: u8,
}

impl Instruction {
    pub fn size(&self) -> u32 {
        self.op.size()
    }

    pub fn next(&self) -> u32 {
        self.address + self.size()
    }

    pub fn immediate(&self) -> i32 {
        self.operand as i32
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op.size() {
            1 => write!(f, "{:08X}: {}", self.address, self.op.mnemonic()),
            5 if self.op == Opcode::PushI => {
                write!(f, "{:08X}: {} {}", self.address, self.op.mnemonic(), self.immediate())
            }
            5 => write!(f, "{:08X}: {} 0x{:X}", self.address, self.op.mnemonic(), self.operand),
            _ => write!(
                f,
                "{:08X}: {} 0x{:X}[{}]",
                self.address,
                self.op.mnemonic(),
                self.operand,
                self.index
            ),
        }
    }
}

/// Decode the instruction at `pc`.
pub fn decode(code: &[u8], pc: u32) -> Result<Instruction, VmError> {
    let len = code.len() as u32;
    let at = pc as usize;
    let Some(&raw) = code.get(at) else {
        return Err(VmError::PcOutOfRange { pc, len });
    };
    let op = Opcode::try_from(raw).map_err(|opcode| VmError::InvalidOpcode { opcode, pc })?;
    if pc.saturating_add(op.size()) > len {
        return Err(VmError::PcOutOfRange { pc, len });
    }

    let (operand, index) = match op.size() {
        1 => (0, 0),
        5 => (LittleEndian::read_u32(&code[at + 1..at + 5]), 0),
        _ => (LittleEndian::read_u32(&code[at + 1..at + 5]), code[at + 5]),
    };
    Ok(Instruction { address: pc, op, operand, index })
}

/// Decode every instruction in `[start, end)`; stops at the first decoding error.
pub fn decode_range(code: &[u8], start: u32, end: u32) -> Result<Vec<Instruction>, VmError> {
    let mut out = Vec::new();
    let mut pc = start;
    while pc < end {
        let ins = decode(code, pc)?;
        pc = ins.next();
        out.push(ins);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_operands_little_endian() {
        let code = [64, 0x2A, 0, 0, 0, 245, 3, 0, 0, 0, 7, 60];
        let a = decode(&code, 0).unwrap();
        assert_eq!(a.op, Opcode::PushI);
        assert_eq!(a.immediate(), 42);
        let b = decode(&code, a.next()).unwrap();
        assert_eq!((b.op, b.operand, b.index), (Opcode::PushVV, 3, 7));
        let c = decode(&code, b.next()).unwrap();
        assert_eq!(c.op, Opcode::Rsr);
    }

    #[test]
    fn truncated_operand_is_reported() {
        let code = [61, 1, 2];
        assert!(matches!(decode(&code, 0), Err(VmError::PcOutOfRange { .. })));
    }

    #[test]
    fn unknown_byte_is_invalid() {
        assert!(matches!(decode(&[10], 0), Err(VmError::InvalidOpcode { opcode: 10, pc: 0 })));
    }
}
