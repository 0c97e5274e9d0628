//! Host-side view of a linked function: the Rust values a caller passes in
//! and gets back, the canonical shape of each, and the frame they are packed
//! into before a program runs.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use link_abi::{CallingConvention, Function, Hardware, Location, ResolveError, Value, zero};

use crate::callback::Callback;
use crate::compiler::CompileErrorKind;
use crate::ctype::{self, CKind};
use crate::tag::{Argument, Bound, Ownership, Type};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    F32,
    F64,
    Pointer,
    Str,
    Bytes,
    Callback,
    Time,
    Error,
    Struct(Vec<HostType>),
}

impl HostType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            HostType::Bool
                | HostType::I8
                | HostType::I16
                | HostType::I32
                | HostType::I64
                | HostType::Isize
                | HostType::U8
                | HostType::U16
                | HostType::U32
                | HostType::U64
                | HostType::Usize
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            HostType::I8 | HostType::I16 | HostType::I32 | HostType::I64 | HostType::Isize
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, HostType::F32 | HostType::F64)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, HostType::Struct(_))
    }

    /// Scalars that travel as a single word in the host frame.
    pub fn is_word(&self) -> bool {
        self.is_integer()
            || self.is_float()
            || matches!(
                self,
                HostType::Pointer | HostType::Callback | HostType::Time | HostType::Error
            )
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostType::Unit => "()",
            HostType::Bool => "bool",
            HostType::I8 => "i8",
            HostType::I16 => "i16",
            HostType::I32 => "i32",
            HostType::I64 => "i64",
            HostType::Isize => "isize",
            HostType::U8 => "u8",
            HostType::U16 => "u16",
            HostType::U32 => "u32",
            HostType::U64 => "u64",
            HostType::Usize => "usize",
            HostType::F32 => "f32",
            HostType::F64 => "f64",
            HostType::Pointer => "pointer",
            HostType::Str => "str",
            HostType::Bytes => "bytes",
            HostType::Callback => "callback",
            HostType::Time => "time",
            HostType::Error => "error",
            HostType::Struct(fields) => {
                f.write_str("{")?;
                for (index, field) in fields.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                return f.write_str("}");
            }
        };
        f.write_str(name)
    }
}

/// Failure reported by a native function through its return value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeError {
    pub symbol: String,
    pub code: i64,
    /// Result of the failure handler, when the tag names one.
    pub detail: Option<i64>,
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with {}", self.symbol, self.code)?;
        if let Some(detail) = self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for NativeError {}

#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Unit,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Isize(isize),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Usize(usize),
    F32(f32),
    F64(f64),
    Pointer(usize),
    Str(String),
    Bytes(Vec<u8>),
    Callback(Callback),
    Time(SystemTime),
    Error(Option<NativeError>),
    Struct(Vec<HostValue>),
}

impl HostValue {
    pub fn host_type(&self) -> HostType {
        match self {
            HostValue::Unit => HostType::Unit,
            HostValue::Bool(_) => HostType::Bool,
            HostValue::I8(_) => HostType::I8,
            HostValue::I16(_) => HostType::I16,
            HostValue::I32(_) => HostType::I32,
            HostValue::I64(_) => HostType::I64,
            HostValue::Isize(_) => HostType::Isize,
            HostValue::U8(_) => HostType::U8,
            HostValue::U16(_) => HostType::U16,
            HostValue::U32(_) => HostType::U32,
            HostValue::U64(_) => HostType::U64,
            HostValue::Usize(_) => HostType::Usize,
            HostValue::F32(_) => HostType::F32,
            HostValue::F64(_) => HostType::F64,
            HostValue::Pointer(_) => HostType::Pointer,
            HostValue::Str(_) => HostType::Str,
            HostValue::Bytes(_) => HostType::Bytes,
            HostValue::Callback(_) => HostType::Callback,
            HostValue::Time(_) => HostType::Time,
            HostValue::Error(_) => HostType::Error,
            HostValue::Struct(fields) => {
                HostType::Struct(fields.iter().map(HostValue::host_type).collect())
            }
        }
    }

    /// Integer view of a word-sized value, sign-extended where signed.
    pub fn as_i64(&self) -> Option<i64> {
        let value = match self {
            HostValue::Bool(value) => *value as i64,
            HostValue::I8(value) => *value as i64,
            HostValue::I16(value) => *value as i64,
            HostValue::I32(value) => *value as i64,
            HostValue::I64(value) => *value,
            HostValue::Isize(value) => *value as i64,
            HostValue::U8(value) => *value as i64,
            HostValue::U16(value) => *value as i64,
            HostValue::U32(value) => *value as i64,
            HostValue::U64(value) => *value as i64,
            HostValue::Usize(value) => *value as i64,
            HostValue::Pointer(value) => *value as i64,
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostSignature {
    pub args: Vec<HostType>,
    pub rets: Vec<HostType>,
}

impl HostSignature {
    pub fn new(args: Vec<HostType>, rets: Vec<HostType>) -> Self {
        Self { args, rets }
    }

    /// Natural host signature for a function tag. Derived arguments are
    /// skipped since the host never supplies them.
    pub fn infer(ty: &Type) -> Result<HostSignature, CompileErrorKind> {
        if !ty.is_func() {
            return Err(CompileErrorKind::NotAFunction(ty.name.clone()));
        }
        // Arguments whose length another argument's capacity refers to.
        let buffers: Vec<usize> = ty
            .args
            .iter()
            .filter_map(|arg| match &arg.test.capacity {
                Some(Bound {
                    argument: Argument::Index(index),
                    ..
                }) => Some(*index as usize),
                _ => None,
            })
            .collect();
        let mut args = Vec::with_capacity(ty.args.len());
        for (at, arg) in ty.args.iter().enumerate().filter(|(_, arg)| arg.maps > 0) {
            args.push(natural_argument(arg, buffers.contains(&(at + 1)))?);
        }
        let rets = match ty.returns() {
            Some(ret) => match natural_result(ret)? {
                HostType::Unit => Vec::new(),
                host => vec![host],
            },
            None => Vec::new(),
        };
        Ok(HostSignature { args, rets })
    }

    pub fn function(&self) -> Function {
        Function::new(
            self.args.iter().map(value_of).collect(),
            self.rets.iter().map(value_of).collect(),
        )
    }

    /// Host frame layout: every argument then the result, left to right.
    pub fn layout(&self) -> Result<CallingConvention, ResolveError> {
        zero::resolve(&self.function())
    }
}

fn natural_argument(arg: &Type, buffer: bool) -> Result<HostType, CompileErrorKind> {
    if arg.is_func() {
        return Ok(HostType::Callback);
    }
    let Some(c) = ctype::lookup(&arg.name) else {
        return Err(CompileErrorKind::UnknownType(arg.name.clone()));
    };
    if let Some(free) = arg.free {
        return Ok(match (c.kind, free) {
            (CKind::Char, Ownership::Init) => HostType::Bytes,
            (CKind::Char, _) => HostType::Str,
            (CKind::Void, Ownership::Init) => HostType::Bytes,
            (CKind::Void, _) if buffer || arg.test.capacity.is_some() => HostType::Bytes,
            _ => HostType::Pointer,
        });
    }
    natural_scalar(&arg.name, c.kind, &c.value)
}

fn natural_result(ret: &Type) -> Result<HostType, CompileErrorKind> {
    let Some(c) = ctype::lookup(&ret.name) else {
        return Err(CompileErrorKind::UnknownType(ret.name.clone()));
    };
    if ret.free.is_some() {
        return Ok(match c.kind {
            CKind::Char => HostType::Str,
            _ => HostType::Pointer,
        });
    }
    natural_scalar(&ret.name, c.kind, &c.value)
}

fn natural_scalar(name: &str, kind: CKind, value: &Value) -> Result<HostType, CompileErrorKind> {
    let host = match (kind, value) {
        (CKind::Void, _) => HostType::Unit,
        (CKind::Bool, _) => HostType::Bool,
        (CKind::Float, Value::Float4) => HostType::F32,
        (CKind::Float, _) => HostType::F64,
        (CKind::Signed, Value::Bytes1) => HostType::I8,
        (CKind::Signed, Value::Bytes2) => HostType::I16,
        (CKind::Signed, Value::Bytes4) => HostType::I32,
        (CKind::Signed, Value::Sizing) => HostType::Isize,
        (CKind::Signed, _) => HostType::I64,
        (CKind::Unsigned, Value::Bytes1) => HostType::U8,
        (CKind::Unsigned, Value::Bytes2) => HostType::U16,
        (CKind::Unsigned, Value::Bytes4) => HostType::U32,
        (CKind::Unsigned, Value::Sizing) => HostType::Usize,
        (CKind::Unsigned, _) => HostType::U64,
        (CKind::Struct, Value::Struct(fields)) => HostType::Struct(
            fields
                .iter()
                .map(|field| match field {
                    Value::Bytes4 => HostType::I32,
                    _ => HostType::I64,
                })
                .collect(),
        ),
        _ => return Err(CompileErrorKind::MissingMarker(name.to_string())),
    };
    Ok(host)
}

/// Canonical shape of a host value in the frame.
pub fn value_of(ty: &HostType) -> Value {
    match ty {
        HostType::Unit => Value::Bytes0,
        HostType::Bool | HostType::I8 | HostType::U8 => Value::Bytes1,
        HostType::I16 | HostType::U16 => Value::Bytes2,
        HostType::I32 | HostType::U32 => Value::Bytes4,
        HostType::I64 | HostType::U64 | HostType::Time => Value::Bytes8,
        HostType::Isize | HostType::Usize => Value::Sizing,
        HostType::F32 => Value::Float4,
        HostType::F64 => Value::Float8,
        HostType::Pointer | HostType::Callback | HostType::Error => Value::Memory,
        HostType::Str => Value::Struct(vec![Value::Memory, Value::Sizing]),
        HostType::Bytes => Value::Struct(vec![Value::Memory, Value::Sizing, Value::Sizing]),
        HostType::Struct(fields) => Value::Struct(fields.iter().map(value_of).collect()),
    }
}

/// Host `Time` travels as signed nanoseconds since the Unix epoch.
pub fn time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos().min(i64::MAX as u128) as i64,
        Err(err) => -(err.duration().as_nanos().min(i64::MAX as u128) as i64),
    }
}

pub fn time_from_seconds(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

/// Packed host arguments. Slot offsets follow [`HostSignature::layout`]; the
/// pointers written for `Str` and `Bytes` borrow from the argument slice, so a
/// frame must not outlive the values it was packed from.
pub(crate) struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub(crate) fn pack(layout: &CallingConvention, args: &mut [HostValue]) -> Frame {
        let mut frame = Frame {
            bytes: vec![0; layout.stack.max(link_abi::WORD)],
        };
        for (location, value) in layout.args.iter().zip(args.iter_mut()) {
            if let Location::Hardware(Hardware::StackRtl(offset)) = location {
                frame.write_value(*offset, value);
            }
        }
        frame
    }

    fn write_value(&mut self, offset: usize, value: &mut HostValue) {
        match value {
            HostValue::Unit | HostValue::Error(_) => {}
            HostValue::Bool(value) => self.write(offset, &[*value as u8]),
            HostValue::I8(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::U8(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::I16(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::U16(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::I32(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::U32(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::I64(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::U64(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::Isize(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::Usize(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::F32(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::F64(value) => self.write(offset, &value.to_ne_bytes()),
            HostValue::Pointer(address) => self.write(offset, &address.to_ne_bytes()),
            HostValue::Callback(callback) => {
                self.write(offset, &(callback.address() as usize).to_ne_bytes())
            }
            HostValue::Time(time) => self.write(offset, &time_to_nanos(*time).to_ne_bytes()),
            HostValue::Str(text) => {
                self.write(offset, &(text.as_ptr() as usize).to_ne_bytes());
                self.write(offset + 8, &text.len().to_ne_bytes());
            }
            HostValue::Bytes(buffer) => {
                self.write(offset, &(buffer.as_mut_ptr() as usize).to_ne_bytes());
                self.write(offset + 8, &buffer.len().to_ne_bytes());
                self.write(offset + 16, &buffer.capacity().to_ne_bytes());
            }
            HostValue::Struct(fields) => {
                let ty = value_of(&HostType::Struct(
                    fields.iter().map(HostValue::host_type).collect(),
                ));
                for ((at, _), field) in ty.fields().into_iter().zip(fields.iter_mut()) {
                    self.write_value(offset + at, field);
                }
            }
        }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        if let Some(slot) = self.bytes.get_mut(offset..offset + bytes.len()) {
            slot.copy_from_slice(bytes);
        }
    }

    /// Reads `size` bytes at `offset`, zero-extended into a word.
    pub(crate) fn read(&self, offset: usize, size: usize) -> Option<u64> {
        let slice = self.bytes.get(offset..offset + size)?;
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(slice);
        Some(u64::from_ne_bytes(word))
    }

    pub(crate) fn slice(&self, offset: usize, size: usize) -> Option<&[u8]> {
        self.bytes.get(offset..offset + size)
    }
}

/// Rebuilds a host scalar from the low bytes of a register word.
pub(crate) fn scalar_from_bits(ty: &HostType, bits: u64) -> Option<HostValue> {
    let value = match ty {
        HostType::Unit => HostValue::Unit,
        HostType::Bool => HostValue::Bool(bits != 0),
        HostType::I8 => HostValue::I8(bits as i8),
        HostType::I16 => HostValue::I16(bits as i16),
        HostType::I32 => HostValue::I32(bits as i32),
        HostType::I64 => HostValue::I64(bits as i64),
        HostType::Isize => HostValue::Isize(bits as isize),
        HostType::U8 => HostValue::U8(bits as u8),
        HostType::U16 => HostValue::U16(bits as u16),
        HostType::U32 => HostValue::U32(bits as u32),
        HostType::U64 => HostValue::U64(bits),
        HostType::Usize => HostValue::Usize(bits as usize),
        HostType::F32 => HostValue::F32(f32::from_bits(bits as u32)),
        HostType::F64 => HostValue::F64(f64::from_bits(bits)),
        HostType::Pointer => HostValue::Pointer(bits as usize),
        HostType::Time => HostValue::Time(time_from_seconds(bits as i64)),
        _ => return None,
    };
    Some(value)
}

/// Rebuilds a host struct from a native aggregate image.
pub(crate) fn struct_from_image(ty: &HostType, image: &[u8]) -> Option<HostValue> {
    let HostType::Struct(fields) = ty else {
        return None;
    };
    let shape = value_of(ty);
    let mut out = Vec::with_capacity(fields.len());
    for ((offset, value), field) in shape.fields().into_iter().zip(fields) {
        if field.is_struct() {
            let inner = image.get(offset..offset + value.size())?;
            out.push(struct_from_image(field, inner)?);
            continue;
        }
        let size = value.size();
        let slice = image.get(offset..offset + size)?;
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(slice);
        out.push(scalar_from_bits(field, u64::from_ne_bytes(word))?);
    }
    Some(HostValue::Struct(out))
}
