//! The register machine that runs a [`Program`] against host arguments.
//!
//! Every call gets fresh scratch registers, a target stack image, a native
//! register frame and a call-local heap. Only the lease table outlives it.

pub mod dispatch;
mod trampoline;

use std::ffi::{c_char, c_void};
use std::fmt;

use link_abi::{Hardware, Location, Value};
use tracing::warn;

use crate::host::{Frame, HostType, HostValue, NativeError, scalar_from_bits, struct_from_image};
use crate::lease::{Lease, leases};
use crate::logging::category_call;
use crate::program::{Dispatch, HandlerArg, Instruction, PIN_NO_SOURCE, Program, ReturnKind, Slot, Width};
use dispatch::GenericCall;
use trampoline::{NativeFrame, Trampoline};

#[derive(Clone, Debug, PartialEq)]
pub enum CallError {
    ArgumentCount {
        expected: usize,
        got: usize,
    },
    /// `index` is the 0-based host argument.
    ArgumentType {
        index: usize,
        expected: HostType,
        got: HostType,
    },
    Assertion {
        symbol: String,
        check: String,
        detail: Option<i64>,
    },
    Dispatch(String),
    Trampoline(String),
    Bytecode(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            CallError::ArgumentType {
                index,
                expected,
                got,
            } => write!(f, "argument {index}: expected {expected}, got {got}"),
            CallError::Assertion {
                symbol,
                check,
                detail,
            } => {
                write!(f, "{symbol}: assertion failed on {check}")?;
                if let Some(detail) = detail {
                    write!(f, " (handler returned {detail})")?;
                }
                Ok(())
            }
            CallError::Dispatch(message) => write!(f, "dispatch failed: {message}"),
            CallError::Trampoline(message) => write!(f, "trampoline unavailable: {message}"),
            CallError::Bytecode(message) => write!(f, "bad bytecode: {message}"),
        }
    }
}

impl std::error::Error for CallError {}

pub type CallResult<T> = Result<T, CallError>;

impl Program {
    /// Marshals `args`, calls the native function once and converts its
    /// result. `Bytes` arguments are handed to native code in place, so `+`
    /// buffers come back filled.
    pub fn invoke(&self, args: &mut [HostValue]) -> CallResult<HostValue> {
        if args.len() != self.host.args.len() {
            return Err(CallError::ArgumentCount {
                expected: self.host.args.len(),
                got: args.len(),
            });
        }
        for (index, (value, expected)) in args.iter().zip(&self.host.args).enumerate() {
            let got = value.host_type();
            if got != *expected {
                return Err(CallError::ArgumentType {
                    index,
                    expected: expected.clone(),
                    got,
                });
            }
        }
        let frame = Frame::pack(&self.host_layout, args);
        let mut machine = Machine::new(self, frame);
        machine.run(args)
    }
}

#[derive(Debug, Default)]
struct Registers {
    normal: u64,
    length: u64,
    assert: u64,
    result: bool,
}

struct Machine<'p> {
    program: &'p Program,
    frame: Frame,
    regs: Registers,
    /// Target stack image. Generic dispatch reads arguments from it and
    /// writes the result back into it.
    stack: Vec<u64>,
    native: NativeFrame,
    building: Option<Vec<u8>>,
    images: Vec<Box<[u8]>>,
    locals: Vec<Box<[u8]>>,
    heap: usize,
    /// `malloc` copies native code takes over once the call happens.
    sold: Vec<usize>,
    releases: Vec<usize>,
    /// Leases taken while marshaling. They reach the table only once the
    /// call has run.
    pending: Vec<(usize, Lease)>,
    called: bool,
    error: Option<NativeError>,
}

impl Drop for Machine<'_> {
    fn drop(&mut self) {
        for address in self.sold.drain(..) {
            unsafe { libc::free(address as *mut c_void) };
        }
    }
}

fn sign_extend(value: u64, width: Width) -> u64 {
    match width {
        Width::W8 => value as u8 as i8 as i64 as u64,
        Width::W16 => value as u16 as i16 as i64 as u64,
        Width::W32 => value as u32 as i32 as i64 as u64,
        Width::W64 => value,
    }
}

fn bounds(what: &str, offset: usize) -> CallError {
    CallError::Bytecode(format!("{what} offset {offset} out of range"))
}

fn store(stack: &mut [u64], offset: usize, bytes: &[u8]) -> CallResult<()> {
    let len = stack.len() * 8;
    if offset + bytes.len() > len {
        return Err(bounds("stack", offset));
    }
    let base = stack.as_mut_ptr().cast::<u8>();
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len()) };
    Ok(())
}

fn fetch(stack: &[u64], offset: usize, size: usize) -> CallResult<u64> {
    if offset + size > stack.len() * 8 || size > 8 {
        return Err(bounds("stack", offset));
    }
    let mut word = [0u8; 8];
    let base = stack.as_ptr().cast::<u8>();
    unsafe { std::ptr::copy_nonoverlapping(base.add(offset), word.as_mut_ptr(), size) };
    Ok(u64::from_ne_bytes(word))
}

/// Borrows `len` bytes of host memory the frame points at.
///
/// # Safety
///
/// `address` must come from a packed host argument that is still alive.
unsafe fn host_bytes<'a>(address: u64, len: u64) -> &'a [u8] {
    if address == 0 || len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(address as *const u8, len as usize) }
}

impl<'p> Machine<'p> {
    fn new(program: &'p Program, frame: Frame) -> Self {
        let words = (program.target.stack.div_ceil(8).max(2) + 1) & !1;
        let mut stack = vec![0u64; words];
        let prefix = program.host_layout.stack.min(words * 8);
        if let Some(bytes) = frame.slice(0, prefix) {
            let _ = store(&mut stack, 0, bytes);
        }
        Self {
            native: NativeFrame::new(program.function),
            program,
            frame,
            regs: Registers::default(),
            stack,
            building: None,
            images: Vec::new(),
            locals: Vec::new(),
            heap: 0,
            sold: Vec::new(),
            releases: Vec::new(),
            pending: Vec::new(),
            called: false,
            error: None,
        }
    }

    fn run(&mut self, args: &[HostValue]) -> CallResult<HostValue> {
        let program = self.program;
        let code = &program.code;
        let mut ip = 0;
        while ip < code.len() {
            let (instruction, next) = Instruction::decode(code, ip)
                .map_err(|err| CallError::Bytecode(err.to_string()))?;
            ip = next;
            if let Some(value) = self.step(instruction, args)? {
                return Ok(value);
            }
        }
        Err(CallError::Bytecode("program ended without a return".to_string()))
    }

    fn charge(&mut self, bytes: usize) -> CallResult<()> {
        self.heap += bytes;
        if self.heap > self.program.max_call_heap {
            return Err(CallError::Bytecode(format!(
                "call heap exceeds {} bytes",
                self.program.max_call_heap
            )));
        }
        Ok(())
    }

    fn register(&mut self, slot: Slot) -> CallResult<&mut u64> {
        let register = match slot {
            Slot::Gpr(index) => self.native.gpr.get_mut(index as usize),
            Slot::Fpr(index) => self.native.fpr.get_mut(index as usize),
            Slot::Stack(_) => None,
        };
        register.ok_or_else(|| CallError::Bytecode(format!("no register {slot}")))
    }

    fn step(&mut self, instruction: Instruction, args: &[HostValue]) -> CallResult<Option<HostValue>> {
        match instruction {
            Instruction::Move(width, offset) => {
                self.regs.normal = self
                    .frame
                    .read(offset as usize, width.bytes())
                    .ok_or_else(|| bounds("frame", offset as usize))?;
            }
            Instruction::MoveLen(offset) => {
                self.regs.length = self
                    .frame
                    .read(offset as usize, 8)
                    .ok_or_else(|| bounds("frame", offset as usize))?;
            }
            Instruction::HostCopy { offset, size } => {
                self.charge(size as usize)?;
                let bytes = self
                    .frame
                    .slice(offset as usize, size as usize)
                    .ok_or_else(|| bounds("frame", offset as usize))?;
                self.building
                    .as_mut()
                    .ok_or_else(|| CallError::Bytecode("copy without an open image".to_string()))?
                    .extend_from_slice(bytes);
            }
            Instruction::Extend(width) => self.regs.normal = sign_extend(self.regs.normal, width),
            Instruction::Widen => {
                self.regs.normal = (f32::from_bits(self.regs.normal as u32) as f64).to_bits();
            }
            Instruction::Narrow => {
                self.regs.normal = (f64::from_bits(self.regs.normal) as f32).to_bits() as u64;
            }
            Instruction::Copy(width, slot) => {
                let value = self.regs.normal & width.mask();
                match slot {
                    Slot::Stack(offset) => {
                        store(&mut self.stack, offset as usize, &value.to_ne_bytes()[..width.bytes()])?
                    }
                    slot => *self.register(slot)? = value,
                }
            }
            Instruction::Load(width, slot) => {
                self.regs.normal = match slot {
                    Slot::Stack(offset) => fetch(&self.stack, offset as usize, width.bytes())?,
                    slot => *self.register(slot)? & width.mask(),
                };
            }
            Instruction::StackCopy(offset) => {
                let image = self
                    .images
                    .last()
                    .ok_or_else(|| CallError::Bytecode("no image to copy".to_string()))?;
                store(&mut self.stack, offset as usize, image)?;
            }
            Instruction::Data(index) => {
                self.regs.normal = *self
                    .program
                    .data
                    .get(index as usize)
                    .ok_or_else(|| CallError::Bytecode(format!("data index {index} out of range")))?;
            }
            Instruction::SwapLength => std::mem::swap(&mut self.regs.normal, &mut self.regs.length),
            Instruction::SwapAssert => std::mem::swap(&mut self.regs.normal, &mut self.regs.assert),
            Instruction::Assert { relation, signed } => {
                let ordering = if signed {
                    (self.regs.normal as i64).cmp(&(self.regs.assert as i64))
                } else {
                    self.regs.normal.cmp(&self.regs.assert)
                };
                self.regs.result = relation.holds(ordering);
            }
            Instruction::Flip => self.regs.result = !self.regs.result,
            Instruction::Guard(index) => {
                if !self.regs.result {
                    return Err(self.assertion(index));
                }
            }
            Instruction::ErrorMake(index) => {
                if !self.regs.result && self.error.is_none() {
                    self.error = Some(NativeError {
                        symbol: self.program.symbol.clone(),
                        code: self.regs.normal as i64,
                        detail: self.handle(index),
                    });
                }
            }
            Instruction::HeapMake => self.building = Some(Vec::new()),
            Instruction::HeapPut(width, offset) => {
                let end = offset as usize + width.bytes();
                let grown = end.saturating_sub(self.building.as_ref().map_or(0, Vec::len));
                self.charge(grown)?;
                let value = self.regs.normal;
                let buffer = self
                    .building
                    .as_mut()
                    .ok_or_else(|| CallError::Bytecode("put without an open image".to_string()))?;
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[offset as usize..end].copy_from_slice(&value.to_ne_bytes()[..width.bytes()]);
            }
            Instruction::HeapLoad => {
                let image = self
                    .building
                    .take()
                    .ok_or_else(|| CallError::Bytecode("no open image".to_string()))?
                    .into_boxed_slice();
                self.regs.normal = image.as_ptr() as u64;
                self.images.push(image);
            }
            Instruction::StringMake => {
                let len = self.regs.length as usize;
                self.charge(len + 1)?;
                let bytes = unsafe { host_bytes(self.regs.normal, self.regs.length) };
                let mut local = Vec::with_capacity(len + 1);
                local.extend_from_slice(bytes);
                local.push(0);
                let local = local.into_boxed_slice();
                self.regs.normal = local.as_ptr() as u64;
                self.locals.push(local);
            }
            Instruction::StringCopy => {
                let len = self.regs.length as usize;
                let bytes = unsafe { host_bytes(self.regs.normal, self.regs.length) };
                let copy = unsafe { libc::malloc(len + 1) }.cast::<u8>();
                if copy.is_null() {
                    return Err(CallError::Dispatch(format!("malloc of {} bytes failed", len + 1)));
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), copy, bytes.len());
                    *copy.add(bytes.len()) = 0;
                }
                self.sold.push(copy as usize);
                self.regs.normal = copy as u64;
            }
            Instruction::StringSize => {
                self.regs.length = if self.regs.normal == 0 {
                    0
                } else {
                    unsafe { libc::strlen(self.regs.normal as *const c_char) as u64 }
                };
            }
            Instruction::PointerKeep => {
                let bytes = unsafe { host_bytes(self.regs.normal, self.regs.length) };
                let (address, lease) = Lease::copy(bytes);
                self.regs.normal = address as u64;
                self.lease(address, lease);
            }
            Instruction::PointerPin(source) => {
                let callback = match args.get(source as usize) {
                    Some(HostValue::Callback(callback)) if source != PIN_NO_SOURCE => {
                        Some(callback.clone())
                    }
                    _ => None,
                };
                let address = self.regs.normal as usize;
                self.lease(address, Lease::pinned(callback));
            }
            Instruction::PointerFree => self.releases.push(self.regs.normal as usize),
            Instruction::UnixTime => {
                self.regs.normal = (self.regs.normal as i64).div_euclid(1_000_000_000) as u64;
            }
            Instruction::Call => {
                self.call()?;
                self.called = true;
                self.sold.clear();
                for (address, lease) in self.pending.drain(..) {
                    leases().insert(address, lease);
                }
                for address in self.releases.drain(..) {
                    leases().release(address);
                }
            }
            Instruction::Return(kind) => return self.finish(kind).map(Some),
        }
        Ok(None)
    }

    fn lease(&mut self, address: usize, lease: Lease) {
        if self.called {
            leases().insert(address, lease);
        } else {
            self.pending.push((address, lease));
        }
    }

    fn call(&mut self) -> CallResult<()> {
        let program = self.program;
        let dispatch = &program.dispatch;
        let outcome = match dispatch {
            Dispatch::Generic(call) => self.call_generic(call),
            Dispatch::Direct(_) => self.call_direct(),
        };
        if let Err(err) = &outcome {
            warn!(
                "{} {} ({}) dispatch failed: {err}",
                category_call(),
                program.symbol,
                dispatch.name()
            );
        }
        outcome
    }

    fn call_generic(&mut self, call: &GenericCall) -> CallResult<()> {
        let len = self.stack.len() * 8;
        let base = self.stack.as_mut_ptr().cast::<u8>();
        let address = |location: &Location| -> CallResult<*mut c_void> {
            match location {
                Location::Hardware(Hardware::StackRtl(offset)) if *offset < len => {
                    Ok(unsafe { base.add(*offset) }.cast::<c_void>())
                }
                Location::Empty => Ok(base.cast::<c_void>()),
                other => Err(CallError::Dispatch(format!("cannot pass {other:?} generically"))),
            }
        };
        let mut pointers = self
            .program
            .target
            .args
            .iter()
            .map(address)
            .collect::<CallResult<Vec<_>>>()?;
        let mut scratch = [0u64; 2];
        let result = match self.program.target.rets.first() {
            Some(location) => address(location)?,
            None => scratch.as_mut_ptr().cast::<c_void>(),
        };
        unsafe { call.call(self.program.function, &mut pointers, result) };
        Ok(())
    }

    fn call_direct(&mut self) -> CallResult<()> {
        let trampoline = Trampoline::prepare().map_err(CallError::Trampoline)?;
        let words = (self.program.target.stack.div_ceil(8) + 1) & !1;
        if words > self.stack.len() {
            return Err(CallError::Dispatch(format!("stack image of {words} words is too small")));
        }
        self.native.stack = self.stack.as_ptr();
        self.native.stack_words = words as u64;
        unsafe { trampoline.invoke(&mut self.native) };
        Ok(())
    }

    fn handle(&self, index: u16) -> Option<i64> {
        let handler = self.program.checks.get(index as usize)?.handler.as_ref()?;
        let mut values: Vec<i64> = handler
            .args
            .iter()
            .map(|arg| match arg {
                HandlerArg::Frame {
                    offset,
                    size,
                    signed,
                } => {
                    let bits = self.frame.read(*offset as usize, *size as usize).unwrap_or(0);
                    if *signed {
                        sign_extend(bits, Width::covering(*size as usize)) as i64
                    } else {
                        bits as i64
                    }
                }
                HandlerArg::Value(value) => *value,
            })
            .collect();
        let shapes = vec![(Value::Bytes8, true); values.len()];
        let call = GenericCall::new(&shapes, Some(&(Value::Bytes4, true)));
        let mut pointers: Vec<*mut c_void> = values
            .iter_mut()
            .map(|value| (value as *mut i64).cast::<c_void>())
            .collect();
        let mut result = 0u64;
        unsafe {
            call.call(
                handler.address,
                &mut pointers,
                (&mut result as *mut u64).cast::<c_void>(),
            )
        };
        Some(result as u32 as i32 as i64)
    }

    fn assertion(&self, index: u16) -> CallError {
        let check = match self.program.checks.get(index as usize) {
            Some(check) => format!("{} {}", check.subject, check.condition),
            None => format!("check {index}"),
        };
        CallError::Assertion {
            symbol: self.program.symbol.clone(),
            check,
            detail: self.handle(index),
        }
    }

    fn finish(&mut self, kind: ReturnKind) -> CallResult<HostValue> {
        let ty = self.program.host.rets.first().cloned().unwrap_or(HostType::Unit);
        match kind {
            ReturnKind::Unit => Ok(HostValue::Unit),
            ReturnKind::Scalar => scalar_from_bits(&ty, self.regs.normal)
                .ok_or_else(|| CallError::Bytecode(format!("cannot build host {ty} from a scalar"))),
            ReturnKind::Str | ReturnKind::StrFree => {
                let bytes = unsafe { host_bytes(self.regs.normal, self.regs.length) };
                let text = String::from_utf8_lossy(bytes).into_owned();
                if kind == ReturnKind::StrFree && self.regs.normal != 0 {
                    unsafe { libc::free(self.regs.normal as *mut c_void) };
                }
                Ok(HostValue::Str(text))
            }
            ReturnKind::Error => Ok(HostValue::Error(self.error.take())),
            ReturnKind::Image => {
                let image = self
                    .images
                    .last()
                    .ok_or_else(|| CallError::Bytecode("no image to return".to_string()))?;
                struct_from_image(&ty, image)
                    .ok_or_else(|| CallError::Bytecode(format!("cannot build host {ty} from an image")))
            }
        }
    }
}
