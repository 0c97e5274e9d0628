use std::fmt::{self, Write as _};

use link_abi::{Arch, CallingConvention};

use crate::host::HostSignature;
use crate::tag::Relation;
use crate::vm::dispatch::GenericCall;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move8 = 0x01,
    Move16 = 0x02,
    Move32 = 0x03,
    Move64 = 0x04,
    MoveLen = 0x05,
    HostCopy = 0x06,
    Extend8 = 0x08,
    Extend16 = 0x09,
    Extend32 = 0x0A,
    Widen = 0x0B,
    Narrow = 0x0C,
    Copy8 = 0x10,
    Copy16 = 0x11,
    Copy32 = 0x12,
    Copy64 = 0x13,
    Load8 = 0x14,
    Load16 = 0x15,
    Load32 = 0x16,
    Load64 = 0x17,
    StackCopy = 0x18,
    Data = 0x20,
    SwapLength = 0x21,
    SwapAssert = 0x22,
    Assert = 0x28,
    Flip = 0x29,
    Guard = 0x2A,
    ErrorMake = 0x2B,
    HeapMake = 0x30,
    HeapPut8 = 0x31,
    HeapPut16 = 0x32,
    HeapPut32 = 0x33,
    HeapPut64 = 0x34,
    HeapLoad = 0x35,
    StringMake = 0x40,
    StringCopy = 0x41,
    StringSize = 0x42,
    PointerKeep = 0x48,
    PointerPin = 0x49,
    PointerFree = 0x4A,
    UnixTime = 0x50,
    Call = 0x60,
    Return = 0x61,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use OpCode::*;
        const ALL: [OpCode; 42] = [
            Move8, Move16, Move32, Move64, MoveLen, HostCopy, Extend8, Extend16, Extend32, Widen,
            Narrow, Copy8, Copy16, Copy32, Copy64, Load8, Load16, Load32, Load64, StackCopy, Data,
            SwapLength, SwapAssert, Assert, Flip, Guard, ErrorMake, HeapMake, HeapPut8, HeapPut16,
            HeapPut32, HeapPut64, HeapLoad, StringMake, StringCopy,
            StringSize, PointerKeep, PointerPin, PointerFree, UnixTime, Call, Return,
        ];
        ALL.into_iter().find(|op| *op as u8 == byte)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Move8 => "move8",
            OpCode::Move16 => "move16",
            OpCode::Move32 => "move32",
            OpCode::Move64 => "move64",
            OpCode::MoveLen => "movelen",
            OpCode::HostCopy => "hostcopy",
            OpCode::Extend8 => "extend8",
            OpCode::Extend16 => "extend16",
            OpCode::Extend32 => "extend32",
            OpCode::Widen => "widen",
            OpCode::Narrow => "narrow",
            OpCode::Copy8 => "copy8",
            OpCode::Copy16 => "copy16",
            OpCode::Copy32 => "copy32",
            OpCode::Copy64 => "copy64",
            OpCode::Load8 => "load8",
            OpCode::Load16 => "load16",
            OpCode::Load32 => "load32",
            OpCode::Load64 => "load64",
            OpCode::StackCopy => "stackcopy",
            OpCode::Data => "data",
            OpCode::SwapLength => "swaplen",
            OpCode::SwapAssert => "swapassert",
            OpCode::Assert => "assert",
            OpCode::Flip => "flip",
            OpCode::Guard => "guard",
            OpCode::ErrorMake => "errormake",
            OpCode::HeapMake => "heapmake",
            OpCode::HeapPut8 => "heapput8",
            OpCode::HeapPut16 => "heapput16",
            OpCode::HeapPut32 => "heapput32",
            OpCode::HeapPut64 => "heapput64",
            OpCode::HeapLoad => "heapload",
            OpCode::StringMake => "stringmake",
            OpCode::StringCopy => "stringcopy",
            OpCode::StringSize => "stringsize",
            OpCode::PointerKeep => "pointerkeep",
            OpCode::PointerPin => "pointerpin",
            OpCode::PointerFree => "pointerfree",
            OpCode::UnixTime => "unixtime",
            OpCode::Call => "call",
            OpCode::Return => "return",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Narrowest width covering `size` bytes.
    pub fn covering(size: usize) -> Width {
        match size {
            0 | 1 => Width::W8,
            2 => Width::W16,
            3 | 4 => Width::W32,
            _ => Width::W64,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }

    fn index(self) -> u8 {
        match self {
            Width::W8 => 0,
            Width::W16 => 1,
            Width::W32 => 2,
            Width::W64 => 3,
        }
    }

    fn from_index(index: u8) -> Width {
        match index {
            0 => Width::W8,
            1 => Width::W16,
            2 => Width::W32,
            _ => Width::W64,
        }
    }
}

/// A target-side storage place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Gpr(u8),
    Fpr(u8),
    Stack(u32),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Gpr(index) => write!(f, "r{index}"),
            Slot::Fpr(index) => write!(f, "f{index}"),
            Slot::Stack(offset) => write!(f, "sp+{offset}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnKind {
    Unit = 0,
    Scalar = 1,
    Str = 2,
    /// Copy the string, then `free` the native pointer.
    StrFree = 3,
    Error = 4,
    Image = 5,
}

impl ReturnKind {
    fn from_byte(byte: u8) -> Option<Self> {
        [
            ReturnKind::Unit,
            ReturnKind::Scalar,
            ReturnKind::Str,
            ReturnKind::StrFree,
            ReturnKind::Error,
            ReturnKind::Image,
        ]
        .into_iter()
        .find(|kind| *kind as u8 == byte)
    }

    fn name(self) -> &'static str {
        match self {
            ReturnKind::Unit => "unit",
            ReturnKind::Scalar => "scalar",
            ReturnKind::Str => "str",
            ReturnKind::StrFree => "str+free",
            ReturnKind::Error => "error",
            ReturnKind::Image => "image",
        }
    }
}

pub const PIN_NO_SOURCE: u16 = u16::MAX;

const SIGNED_FLAG: u8 = 0x80;

fn relation_code(relation: Relation) -> u8 {
    match relation {
        Relation::Eq => 0,
        Relation::Gt => 1,
        Relation::Ge => 2,
        Relation::Lt => 3,
        Relation::Le => 4,
    }
}

fn relation_from_code(code: u8) -> Option<Relation> {
    match code {
        0 => Some(Relation::Eq),
        1 => Some(Relation::Gt),
        2 => Some(Relation::Ge),
        3 => Some(Relation::Lt),
        4 => Some(Relation::Le),
        _ => None,
    }
}

/// One decoded bytecode step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `$normal` = host frame bytes at the offset, zero-extended.
    Move(Width, u32),
    /// `$length` = sizing word at the offset.
    MoveLen(u32),
    /// Appends host frame bytes to the buffer under construction.
    HostCopy { offset: u32, size: u32 },
    Extend(Width),
    Widen,
    Narrow,
    Copy(Width, Slot),
    Load(Width, Slot),
    /// Copies the last finalized image into the target stack.
    StackCopy(u32),
    Data(u16),
    SwapLength,
    SwapAssert,
    Assert { relation: Relation, signed: bool },
    Flip,
    Guard(u16),
    ErrorMake(u16),
    HeapMake,
    HeapPut(Width, u32),
    HeapLoad,
    StringMake,
    StringCopy,
    StringSize,
    PointerKeep,
    PointerPin(u16),
    PointerFree,
    UnixTime,
    Call,
    Return(ReturnKind),
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        const MOVE: [OpCode; 4] = [OpCode::Move8, OpCode::Move16, OpCode::Move32, OpCode::Move64];
        const COPY: [OpCode; 4] = [OpCode::Copy8, OpCode::Copy16, OpCode::Copy32, OpCode::Copy64];
        const LOAD: [OpCode; 4] = [OpCode::Load8, OpCode::Load16, OpCode::Load32, OpCode::Load64];
        const PUT: [OpCode; 4] = [
            OpCode::HeapPut8,
            OpCode::HeapPut16,
            OpCode::HeapPut32,
            OpCode::HeapPut64,
        ];
        match *self {
            Instruction::Move(width, _) => MOVE[width.index() as usize],
            Instruction::MoveLen(_) => OpCode::MoveLen,
            Instruction::HostCopy { .. } => OpCode::HostCopy,
            Instruction::Extend(Width::W8) => OpCode::Extend8,
            Instruction::Extend(Width::W16) => OpCode::Extend16,
            Instruction::Extend(_) => OpCode::Extend32,
            Instruction::Widen => OpCode::Widen,
            Instruction::Narrow => OpCode::Narrow,
            Instruction::Copy(width, _) => COPY[width.index() as usize],
            Instruction::Load(width, _) => LOAD[width.index() as usize],
            Instruction::StackCopy(_) => OpCode::StackCopy,
            Instruction::Data(_) => OpCode::Data,
            Instruction::SwapLength => OpCode::SwapLength,
            Instruction::SwapAssert => OpCode::SwapAssert,
            Instruction::Assert { .. } => OpCode::Assert,
            Instruction::Flip => OpCode::Flip,
            Instruction::Guard(_) => OpCode::Guard,
            Instruction::ErrorMake(_) => OpCode::ErrorMake,
            Instruction::HeapMake => OpCode::HeapMake,
            Instruction::HeapPut(width, _) => PUT[width.index() as usize],
            Instruction::HeapLoad => OpCode::HeapLoad,
            Instruction::StringMake => OpCode::StringMake,
            Instruction::StringCopy => OpCode::StringCopy,
            Instruction::StringSize => OpCode::StringSize,
            Instruction::PointerKeep => OpCode::PointerKeep,
            Instruction::PointerPin(_) => OpCode::PointerPin,
            Instruction::PointerFree => OpCode::PointerFree,
            Instruction::UnixTime => OpCode::UnixTime,
            Instruction::Call => OpCode::Call,
            Instruction::Return(_) => OpCode::Return,
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match *self {
            Instruction::Move(_, offset)
            | Instruction::MoveLen(offset)
            | Instruction::StackCopy(offset)
            | Instruction::HeapPut(_, offset) => emit_u32(out, offset),
            Instruction::HostCopy { offset, size } => {
                emit_u32(out, offset);
                emit_u32(out, size);
            }
            Instruction::Copy(_, slot) | Instruction::Load(_, slot) => emit_slot(out, slot),
            Instruction::Data(index)
            | Instruction::Guard(index)
            | Instruction::ErrorMake(index)
            | Instruction::PointerPin(index) => emit_u16(out, index),
            Instruction::Assert { relation, signed } => {
                let flag = if signed { SIGNED_FLAG } else { 0 };
                out.push(relation_code(relation) | flag);
            }
            Instruction::Return(kind) => out.push(kind as u8),
            _ => {}
        }
    }

    /// Decodes the instruction at `ip`, returning it with the next offset.
    pub fn decode(code: &[u8], ip: usize) -> Result<(Instruction, usize), ProgramError> {
        let mut cursor = Cursor { code, ip };
        let byte = cursor.u8()?;
        let Some(opcode) = OpCode::from_byte(byte) else {
            return Err(ProgramError::new(ip, format!("invalid opcode 0x{byte:02X}")));
        };
        let width = |base: OpCode| Width::from_index(byte - base as u8);
        let instruction = match opcode {
            OpCode::Move8 | OpCode::Move16 | OpCode::Move32 | OpCode::Move64 => {
                Instruction::Move(width(OpCode::Move8), cursor.u32()?)
            }
            OpCode::MoveLen => Instruction::MoveLen(cursor.u32()?),
            OpCode::HostCopy => Instruction::HostCopy {
                offset: cursor.u32()?,
                size: cursor.u32()?,
            },
            OpCode::Extend8 => Instruction::Extend(Width::W8),
            OpCode::Extend16 => Instruction::Extend(Width::W16),
            OpCode::Extend32 => Instruction::Extend(Width::W32),
            OpCode::Widen => Instruction::Widen,
            OpCode::Narrow => Instruction::Narrow,
            OpCode::Copy8 | OpCode::Copy16 | OpCode::Copy32 | OpCode::Copy64 => {
                Instruction::Copy(width(OpCode::Copy8), cursor.slot()?)
            }
            OpCode::Load8 | OpCode::Load16 | OpCode::Load32 | OpCode::Load64 => {
                Instruction::Load(width(OpCode::Load8), cursor.slot()?)
            }
            OpCode::StackCopy => Instruction::StackCopy(cursor.u32()?),
            OpCode::Data => Instruction::Data(cursor.u16()?),
            OpCode::SwapLength => Instruction::SwapLength,
            OpCode::SwapAssert => Instruction::SwapAssert,
            OpCode::Assert => {
                let code = cursor.u8()?;
                let Some(relation) = relation_from_code(code & !SIGNED_FLAG) else {
                    return Err(ProgramError::new(ip, format!("invalid relation {code}")));
                };
                Instruction::Assert {
                    relation,
                    signed: code & SIGNED_FLAG != 0,
                }
            }
            OpCode::Flip => Instruction::Flip,
            OpCode::Guard => Instruction::Guard(cursor.u16()?),
            OpCode::ErrorMake => Instruction::ErrorMake(cursor.u16()?),
            OpCode::HeapMake => Instruction::HeapMake,
            OpCode::HeapPut8 | OpCode::HeapPut16 | OpCode::HeapPut32 | OpCode::HeapPut64 => {
                Instruction::HeapPut(width(OpCode::HeapPut8), cursor.u32()?)
            }
            OpCode::HeapLoad => Instruction::HeapLoad,
            OpCode::StringMake => Instruction::StringMake,
            OpCode::StringCopy => Instruction::StringCopy,
            OpCode::StringSize => Instruction::StringSize,
            OpCode::PointerKeep => Instruction::PointerKeep,
            OpCode::PointerPin => Instruction::PointerPin(cursor.u16()?),
            OpCode::PointerFree => Instruction::PointerFree,
            OpCode::UnixTime => Instruction::UnixTime,
            OpCode::Call => Instruction::Call,
            OpCode::Return => {
                let byte = cursor.u8()?;
                let Some(kind) = ReturnKind::from_byte(byte) else {
                    return Err(ProgramError::new(ip, format!("invalid return kind {byte}")));
                };
                Instruction::Return(kind)
            }
        };
        Ok((instruction, cursor.ip))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.opcode().mnemonic();
        match *self {
            Instruction::Move(_, offset) | Instruction::MoveLen(offset) => {
                write!(f, "{mnemonic} host+{offset}")
            }
            Instruction::HostCopy { offset, size } => write!(f, "{mnemonic} host+{offset} {size}"),
            Instruction::Copy(_, slot) | Instruction::Load(_, slot) => write!(f, "{mnemonic} {slot}"),
            Instruction::StackCopy(offset) => write!(f, "{mnemonic} sp+{offset}"),
            Instruction::HeapPut(_, offset) => write!(f, "{mnemonic} +{offset}"),
            Instruction::Data(index) => write!(f, "{mnemonic} [{index}]"),
            Instruction::Guard(index) | Instruction::ErrorMake(index) => {
                write!(f, "{mnemonic} #{index}")
            }
            Instruction::PointerPin(PIN_NO_SOURCE) => f.write_str(mnemonic),
            Instruction::PointerPin(source) => write!(f, "{mnemonic} arg{source}"),
            Instruction::Assert { relation, signed } => {
                let sign = if signed { "s" } else { "u" };
                write!(f, "{mnemonic} {}{sign}", relation.symbol())
            }
            Instruction::Return(kind) => write!(f, "{mnemonic} {}", kind.name()),
            _ => f.write_str(mnemonic),
        }
    }
}

fn emit_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn emit_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn emit_slot(out: &mut Vec<u8>, slot: Slot) {
    match slot {
        Slot::Gpr(index) => {
            out.push(0);
            emit_u32(out, index as u32);
        }
        Slot::Fpr(index) => {
            out.push(1);
            emit_u32(out, index as u32);
        }
        Slot::Stack(offset) => {
            out.push(2);
            emit_u32(out, offset);
        }
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    ip: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProgramError> {
        let Some(bytes) = self.code.get(self.ip..self.ip + N) else {
            return Err(ProgramError::new(self.ip, "truncated operand"));
        };
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.ip += N;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProgramError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProgramError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, ProgramError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn slot(&mut self) -> Result<Slot, ProgramError> {
        let start = self.ip;
        let class = self.u8()?;
        let value = self.u32()?;
        match class {
            0 => Ok(Slot::Gpr(value as u8)),
            1 => Ok(Slot::Fpr(value as u8)),
            2 => Ok(Slot::Stack(value)),
            other => Err(ProgramError::new(start, format!("invalid slot class {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramError {
    pub offset: usize,
    pub message: String,
}

impl ProgramError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for ProgramError {}

/// Where a failure handler argument comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerArg {
    Frame { offset: u32, size: u8, signed: bool },
    Value(i64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handler {
    pub name: String,
    pub address: usize,
    pub args: Vec<HandlerArg>,
}

/// A safety assertion referenced by `Guard` and `ErrorMake`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    /// What is being checked, e.g. `return` or `argument 1`.
    pub subject: String,
    /// Human readable condition, e.g. `= @3`.
    pub condition: String,
    pub handler: Option<Handler>,
}

#[derive(Clone, Debug)]
pub enum Dispatch {
    Generic(GenericCall),
    Direct(Arch),
}

impl Dispatch {
    pub fn name(&self) -> &'static str {
        match self {
            Dispatch::Generic(_) => "generic",
            Dispatch::Direct(arch) => arch.name(),
        }
    }
}

/// A compiled, immutable marshaling program bound to one native function.
#[derive(Clone, Debug)]
pub struct Program {
    pub symbol: String,
    pub function: usize,
    pub code: Vec<u8>,
    pub data: Vec<u64>,
    pub checks: Vec<Check>,
    pub host: HostSignature,
    pub host_layout: CallingConvention,
    pub target: CallingConvention,
    pub dispatch: Dispatch,
    pub max_call_heap: usize,
}

impl Program {
    pub fn instructions(&self) -> Result<Vec<Instruction>, ProgramError> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < self.code.len() {
            let (instruction, next) = Instruction::decode(&self.code, ip)?;
            out.push(instruction);
            ip = next;
        }
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), ProgramError> {
        let mut calls = 0;
        let mut ip = 0;
        while ip < self.code.len() {
            let (instruction, next) = Instruction::decode(&self.code, ip)?;
            match instruction {
                Instruction::Call => calls += 1,
                Instruction::Data(index) if index as usize >= self.data.len() => {
                    return Err(ProgramError::new(ip, format!("data index {index} out of range")));
                }
                Instruction::Guard(index) | Instruction::ErrorMake(index)
                    if index as usize >= self.checks.len() =>
                {
                    return Err(ProgramError::new(ip, format!("check {index} out of range")));
                }
                _ => {}
            }
            ip = next;
        }
        if calls != 1 {
            return Err(ProgramError::new(
                self.code.len(),
                format!("expected exactly one call instruction, found {calls}"),
            ));
        }
        Ok(())
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            &mut out,
            "{} @ 0x{:x} ({})",
            self.symbol,
            self.function,
            self.dispatch.name()
        );
        if !self.data.is_empty() {
            let _ = writeln!(&mut out, "data ({}):", self.data.len());
            for (index, value) in self.data.iter().enumerate() {
                let _ = writeln!(&mut out, "  [{index:04}] {}", *value as i64);
            }
        }
        for (index, check) in self.checks.iter().enumerate() {
            let _ = writeln!(&mut out, "  #{index} {} {}", check.subject, check.condition);
        }
        let mut ip = 0;
        while ip < self.code.len() {
            match Instruction::decode(&self.code, ip) {
                Ok((instruction, next)) => {
                    let encoded: Vec<String> =
                        self.code[ip..next].iter().map(|b| format!("{b:02X}")).collect();
                    let _ = writeln!(&mut out, "{ip:04}\t{:<20}\t{instruction}", encoded.join(" "));
                    ip = next;
                }
                Err(err) => {
                    let _ = writeln!(&mut out, "{ip:04}\t<{err}>");
                    break;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_instruction_decodes_to_itself() {
        let samples = [
            Instruction::Move(Width::W16, 8),
            Instruction::HostCopy { offset: 16, size: 24 },
            Instruction::Copy(Width::W32, Slot::Fpr(3)),
            Instruction::Load(Width::W64, Slot::Stack(40)),
            Instruction::Assert {
                relation: Relation::Le,
                signed: true,
            },
            Instruction::PointerPin(PIN_NO_SOURCE),
            Instruction::Return(ReturnKind::StrFree),
        ];
        let mut code = Vec::new();
        for instruction in &samples {
            instruction.encode(&mut code);
        }
        let mut ip = 0;
        for expected in &samples {
            let (instruction, next) = Instruction::decode(&code, ip).expect("decode");
            assert_eq!(&instruction, expected);
            ip = next;
        }
        assert_eq!(ip, code.len());
    }

    #[test]
    fn truncated_operand_is_rejected() {
        let mut code = Vec::new();
        Instruction::Move(Width::W64, 8).encode(&mut code);
        code.pop();
        let err = Instruction::decode(&code, 0).expect_err("truncated");
        assert_eq!(err.message, "truncated operand");
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = Instruction::decode(&[0xFF], 0).expect_err("invalid");
        assert!(err.message.contains("0xFF"));
    }

    #[test]
    fn width_covers_partial_chunks() {
        assert_eq!(Width::covering(3), Width::W32);
        assert_eq!(Width::covering(6), Width::W64);
        assert_eq!(Width::W16.mask(), 0xFFFF);
    }
}
