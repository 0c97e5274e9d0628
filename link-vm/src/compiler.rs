//! Turns a parsed function tag plus a host signature into a [`Program`].
//!
//! Each C argument is compared against the host value backing it. Checks for
//! its assertions come first, then the instructions that bring the value into
//! the target location. `Call` separates argument marshaling from the return
//! path, which reads the target result, checks it and builds the host value.

use std::collections::HashMap;
use std::fmt;

use link_abi::{Arch, CallingConvention, Function, Hardware, Location, ResolveError, Value, zero};
use tracing::{debug, trace};

use crate::assembler::Assembler;
use crate::cache;
use crate::config::{DispatchMode, LinkConfig, direct_dispatch_supported};
use crate::ctype::{self, CKind, CType};
use crate::host::{HostSignature, HostType, value_of};
use crate::logging::category_link;
use crate::program::{
    Check, Dispatch, Handler, HandlerArg, Instruction, PIN_NO_SOURCE, Program, ProgramError,
    ReturnKind, Slot, Width,
};
use crate::tag::{Argument, Ownership, Relation, SyntaxError, Type};
use crate::vm::dispatch::GenericCall;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    Syntax(SyntaxError),
    NotAFunction(String),
    UnknownType(String),
    MissingMarker(String),
    UnknownConstant(String),
    UnknownSymbol(String),
    Resolve(ResolveError),
    ArgumentCount {
        expected: usize,
        got: usize,
    },
    /// `position` is the 1-based C argument, `0` for the return value.
    Unmarshalable {
        position: usize,
        host: HostType,
        target: String,
    },
    UnsupportedOwnership {
        position: usize,
        ownership: char,
        host: HostType,
    },
    UnsupportedAssertion {
        position: usize,
        assertion: String,
    },
    ArgumentReference {
        position: usize,
        index: usize,
    },
    Variadic,
    ReturnArity(usize),
    DirectUnavailable,
    MissingErrorAssertion,
    Bytecode(ProgramError),
}

struct Place(usize);

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("return"),
            position => write!(f, "argument {position}"),
        }
    }
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::Syntax(err) => write!(f, "{err}"),
            CompileErrorKind::NotAFunction(name) => write!(f, "type {name} is not a function"),
            CompileErrorKind::UnknownType(name) => write!(f, "unknown type {name}"),
            CompileErrorKind::MissingMarker(name) => {
                write!(f, "type {name} needs an ownership marker")
            }
            CompileErrorKind::UnknownConstant(name) => write!(f, "unknown constant {name}"),
            CompileErrorKind::UnknownSymbol(name) => write!(f, "unknown failure handler {name}"),
            CompileErrorKind::Resolve(err) => write!(f, "{err}"),
            CompileErrorKind::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} host arguments, got {got}")
            }
            CompileErrorKind::Unmarshalable {
                position,
                host,
                target,
            } => write!(f, "{}: cannot marshal host {host} as {target}", Place(*position)),
            CompileErrorKind::UnsupportedOwnership {
                position,
                ownership,
                host,
            } => write!(
                f,
                "{}: ownership '{ownership}' is not supported for host {host}",
                Place(*position)
            ),
            CompileErrorKind::UnsupportedAssertion {
                position,
                assertion,
            } => write!(f, "{}: assertion {assertion} is not supported", Place(*position)),
            CompileErrorKind::ArgumentReference { position, index } => {
                write!(f, "{}: invalid argument reference @{index}", Place(*position))
            }
            CompileErrorKind::Variadic => f.write_str("variadic functions are not supported"),
            CompileErrorKind::ReturnArity(count) => {
                write!(f, "expected at most one return value, got {count}")
            }
            CompileErrorKind::DirectUnavailable => {
                f.write_str("direct dispatch is not available on this target")
            }
            CompileErrorKind::MissingErrorAssertion => {
                f.write_str("an error result needs an assertion to test")
            }
            CompileErrorKind::Bytecode(err) => write!(f, "invalid bytecode: {err}"),
        }
    }
}

/// A compile failure, qualified by the native symbol being linked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub symbol: String,
    pub kind: CompileErrorKind,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.symbol, self.kind)
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileErrorKind>;

#[derive(Clone, Debug, Default)]
pub struct Compiler {
    config: LinkConfig,
    symbols: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            symbols: HashMap::new(),
        }
    }

    /// Registers a failure handler that tags may name after `;`.
    pub fn with_symbol(mut self, name: impl Into<String>, address: usize) -> Self {
        self.symbols.insert(name.into(), address);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn compile(
        &self,
        symbol: &str,
        address: usize,
        ty: &Type,
        host: &HostSignature,
    ) -> Result<Program, CompileError> {
        let program = self.build(symbol, address, ty, host).map_err(|kind| CompileError {
            symbol: symbol.to_string(),
            kind,
        })?;
        let count = program.instructions().map_or(0, |instructions| instructions.len());
        debug!(
            "{} compiled {symbol} ({}, {count} instructions)",
            category_link(),
            program.dispatch.name()
        );
        if self.config.trace_programs {
            trace!("{}\n{}", category_link(), program.disassemble());
        }
        Ok(program)
    }

    /// Parses `tag`, infers its natural host signature and compiles it
    /// against the first symbol the tag names.
    pub fn link(&self, tag: &str, address: usize) -> Result<Program, CompileError> {
        let parsed = cache::parse_cached(tag).map_err(|err| CompileError {
            symbol: tag.split_whitespace().next().unwrap_or(tag).to_string(),
            kind: CompileErrorKind::Syntax(err),
        })?;
        let (symbols, ty) = parsed.as_ref();
        let symbol = symbols.first().map(String::as_str).unwrap_or_default();
        let host = HostSignature::infer(ty).map_err(|kind| CompileError {
            symbol: symbol.to_string(),
            kind,
        })?;
        self.compile(symbol, address, ty, &host)
    }

    fn build(
        &self,
        symbol: &str,
        address: usize,
        ty: &Type,
        host: &HostSignature,
    ) -> CompileResult<Program> {
        if !ty.is_func() {
            return Err(CompileErrorKind::NotAFunction(ty.name.clone()));
        }
        if ty.more || ty.args.iter().any(|arg| arg.more) {
            return Err(CompileErrorKind::Variadic);
        }
        if host.rets.len() > 1 {
            return Err(CompileErrorKind::ReturnArity(host.rets.len()));
        }

        let params = ty
            .args
            .iter()
            .map(Param::new)
            .collect::<CompileResult<Vec<_>>>()?;
        let expected = params.iter().filter(|param| param.host.is_some()).count();
        if expected != host.args.len() {
            return Err(CompileErrorKind::ArgumentCount {
                expected,
                got: host.args.len(),
            });
        }
        let ret = match ty.returns() {
            Some(tag) => Some(Param::new(tag)?).filter(|param| param.value.size() > 0),
            None => None,
        };

        let function = Function::new(
            params.iter().map(|param| param.value.clone()).collect(),
            ret.iter().map(|param| param.value.clone()).collect(),
        );
        let (dispatch, target) = match self.strategy()? {
            Strategy::Direct(arch) => (
                Dispatch::Direct(arch),
                cache::calling_convention(&function, arch).map_err(CompileErrorKind::Resolve)?,
            ),
            Strategy::Generic => {
                let args: Vec<(Value, bool)> = params
                    .iter()
                    .map(|param| (param.value.clone(), param.signed))
                    .collect();
                let ret = ret.as_ref().map(|param| (param.value.clone(), param.signed));
                (
                    Dispatch::Generic(GenericCall::new(&args, ret.as_ref())),
                    zero::resolve(&function).map_err(CompileErrorKind::Resolve)?,
                )
            }
        };
        let host_layout = host.layout().map_err(CompileErrorKind::Resolve)?;

        let mut emitter = Emitter {
            ty,
            host,
            host_layout: &host_layout,
            target: &target,
            params,
            ret,
            asm: Assembler::new(),
            handler: None,
        };
        emitter.handler = emitter.handler(&self.symbols)?;
        for position in 1..=emitter.params.len() {
            emitter.argument(position)?;
        }
        emitter.asm.push(Instruction::Call);
        emitter.result()?;

        let (code, data, checks) = emitter.asm.finish();
        let program = Program {
            symbol: symbol.to_string(),
            function: address,
            code,
            data,
            checks,
            host: host.clone(),
            host_layout,
            target,
            dispatch,
            max_call_heap: self.config.max_call_heap,
        };
        program.validate().map_err(CompileErrorKind::Bytecode)?;
        Ok(program)
    }

    fn strategy(&self) -> CompileResult<Strategy> {
        match self.config.dispatch {
            DispatchMode::Generic => Ok(Strategy::Generic),
            DispatchMode::Direct if direct_dispatch_supported() => {
                Ok(Strategy::Direct(Arch::native()))
            }
            DispatchMode::Direct => Err(CompileErrorKind::DirectUnavailable),
            DispatchMode::Auto if direct_dispatch_supported() => {
                Ok(Strategy::Direct(Arch::native()))
            }
            DispatchMode::Auto => Ok(Strategy::Generic),
        }
    }
}

enum Strategy {
    Direct(Arch),
    Generic,
}

/// Compiles with the default configuration and no failure handlers.
pub fn compile(
    symbol: &str,
    address: usize,
    ty: &Type,
    host: &HostSignature,
) -> Result<Program, CompileError> {
    Compiler::default().compile(symbol, address, ty, host)
}

pub fn link(tag: &str, address: usize) -> Result<Program, CompileError> {
    Compiler::default().link(tag, address)
}

/// One C parameter or result with its target shape.
struct Param<'t> {
    tag: &'t Type,
    ctype: Option<CType>,
    value: Value,
    signed: bool,
    /// Index into the host arguments, `None` for derived parameters.
    host: Option<usize>,
}

impl<'t> Param<'t> {
    fn new(tag: &'t Type) -> CompileResult<Self> {
        let host = tag.maps.checked_sub(1);
        if tag.is_func() {
            return Ok(Self {
                tag,
                ctype: None,
                value: Value::Memory,
                signed: false,
                host,
            });
        }
        let Some(c) = ctype::lookup(&tag.name) else {
            return Err(CompileErrorKind::UnknownType(tag.name.clone()));
        };
        if tag.free.is_some() && !tag.is_derived() {
            return Ok(Self {
                tag,
                ctype: Some(c),
                value: Value::Memory,
                signed: false,
                host,
            });
        }
        if c.needs_marker() {
            return Err(CompileErrorKind::MissingMarker(tag.name.clone()));
        }
        Ok(Self {
            tag,
            signed: c.is_signed(),
            value: c.value.clone(),
            ctype: Some(c),
            host,
        })
    }

    fn is_char(&self) -> bool {
        self.ctype.as_ref().is_some_and(|c| c.kind == CKind::Char)
    }

    fn is_pointer_shaped(&self) -> bool {
        self.tag.is_func() || (self.tag.free.is_some() && !self.tag.is_derived())
    }
}

#[derive(Clone, Copy)]
enum Subject {
    Host(usize),
    Result,
}

fn slot(hardware: Hardware) -> Slot {
    match hardware {
        Hardware::Register(index) => Slot::Gpr(index),
        Hardware::Floating(index) => Slot::Fpr(index),
        Hardware::StackRtl(offset) => Slot::Stack(offset as u32),
    }
}

fn width_of(value: &Value) -> Width {
    Width::covering(value.size())
}

struct Emitter<'a> {
    ty: &'a Type,
    host: &'a HostSignature,
    host_layout: &'a CallingConvention,
    target: &'a CallingConvention,
    params: Vec<Param<'a>>,
    ret: Option<Param<'a>>,
    asm: Assembler,
    handler: Option<Handler>,
}

impl Emitter<'_> {
    fn push(&mut self, instruction: Instruction) {
        self.asm.push(instruction);
    }

    fn host_offset(&self, index: usize) -> u32 {
        match self.host_layout.args.get(index) {
            Some(Location::Hardware(Hardware::StackRtl(offset))) => *offset as u32,
            _ => 0,
        }
    }

    fn param(&self, position: usize, index: usize) -> CompileResult<&Param<'_>> {
        index
            .checked_sub(1)
            .and_then(|at| self.params.get(at))
            .ok_or(CompileErrorKind::ArgumentReference { position, index })
    }

    fn handler(&self, symbols: &HashMap<String, usize>) -> CompileResult<Option<Handler>> {
        let Some(call) = &self.ty.call else {
            return Ok(None);
        };
        let Some(address) = symbols.get(&call.name) else {
            return Err(CompileErrorKind::UnknownSymbol(call.name.clone()));
        };
        let mut args = Vec::with_capacity(call.args.len());
        for argument in &call.args {
            args.push(match argument {
                Argument::Value(value) => HandlerArg::Value(*value),
                Argument::Const(name) => HandlerArg::Value(
                    ctype::constant(name)
                        .ok_or_else(|| CompileErrorKind::UnknownConstant(name.clone()))?,
                ),
                Argument::Index(index) => {
                    let index = *index as usize;
                    let param = self.param(0, index)?;
                    match (param.host, &param.tag.test.equality) {
                        (Some(host), _) => {
                            let ty = &self.host.args[host];
                            let size = if ty.is_word() { value_of(ty).size() } else { 8 };
                            HandlerArg::Frame {
                                offset: self.host_offset(host),
                                size: size as u8,
                                signed: ty.is_signed(),
                            }
                        }
                        (None, Some(Argument::Value(value))) => HandlerArg::Value(*value),
                        _ => return Err(CompileErrorKind::ArgumentReference { position: 0, index }),
                    }
                }
            });
        }
        Ok(Some(Handler {
            name: call.name.clone(),
            address: *address,
            args,
        }))
    }

    /// Loads a host argument as a comparable scalar into `$normal`.
    fn load_host(&mut self, position: usize, index: usize) -> CompileResult<()> {
        let ty = self.host.args[index].clone();
        let offset = self.host_offset(index);
        match ty {
            HostType::Time => {
                self.push(Instruction::Move(Width::W64, offset));
                self.push(Instruction::UnixTime);
            }
            ty if ty.is_word() => {
                let width = width_of(&value_of(&ty));
                self.push(Instruction::Move(width, offset));
                if ty.is_signed() && width != Width::W64 {
                    self.push(Instruction::Extend(width));
                }
            }
            _ => {
                let index = self
                    .params
                    .iter()
                    .position(|param| param.host == Some(index))
                    .map_or(0, |at| at + 1);
                return Err(CompileErrorKind::ArgumentReference { position, index });
            }
        }
        Ok(())
    }

    fn load_param(&mut self, position: usize, index: usize, depth: usize) -> CompileResult<()> {
        let host = self.param(position, index)?.host;
        match host {
            Some(host) => self.load_host(position, host),
            None => self.load_derived(index, depth + 1),
        }
    }

    fn load_reference(&mut self, position: usize, argument: &Argument, depth: usize) -> CompileResult<()> {
        match argument {
            Argument::Value(value) => {
                let index = self.asm.data(*value as u64);
                self.push(Instruction::Data(index));
            }
            Argument::Const(name) => {
                let value = ctype::constant(name)
                    .ok_or_else(|| CompileErrorKind::UnknownConstant(name.clone()))?;
                let index = self.asm.data(value as u64);
                self.push(Instruction::Data(index));
            }
            Argument::Index(index) => self.load_param(position, *index as usize, depth)?,
        }
        Ok(())
    }

    /// Computes a derived parameter from its own assertion.
    fn load_derived(&mut self, position: usize, depth: usize) -> CompileResult<()> {
        if depth > self.params.len() {
            return Err(CompileErrorKind::ArgumentReference {
                position,
                index: position,
            });
        }
        let test = self.params[position - 1].tag.test.clone();
        if let Some(bound) = &test.capacity {
            let Argument::Index(index) = bound.argument else {
                return Err(CompileErrorKind::UnsupportedAssertion {
                    position,
                    assertion: format!("[{}{}]", bound.relation.symbol(), bound.argument),
                });
            };
            let index = index as usize;
            let offset = self.buffer_offset(position, index)?;
            self.push(Instruction::MoveLen(offset + 8));
            self.push(Instruction::SwapLength);
            return Ok(());
        }
        match &test.equality {
            Some(argument) => self.load_reference(position, argument, depth),
            None => Err(CompileErrorKind::ArgumentReference {
                position,
                index: position,
            }),
        }
    }

    /// Host frame offset of the `Str` or `Bytes` backing C argument `index`.
    fn buffer_offset(&self, position: usize, index: usize) -> CompileResult<u32> {
        let param = self.param(position, index)?;
        match param.host {
            Some(host) if matches!(self.host.args[host], HostType::Str | HostType::Bytes) => {
                Ok(self.host_offset(host))
            }
            _ => Err(CompileErrorKind::ArgumentReference { position, index }),
        }
    }

    fn result_slot(&self) -> CompileResult<(Slot, Width, bool)> {
        let Some(ret) = &self.ret else {
            return Err(CompileErrorKind::UnsupportedAssertion {
                position: 0,
                assertion: "on void".to_string(),
            });
        };
        match self.target.rets.first() {
            Some(Location::Hardware(hardware)) if !ret.value.is_struct() => {
                Ok((slot(*hardware), width_of(&ret.value), ret.signed))
            }
            _ => Err(CompileErrorKind::UnsupportedAssertion {
                position: 0,
                assertion: "on aggregate".to_string(),
            }),
        }
    }

    fn load_subject(&mut self, position: usize, subject: Subject) -> CompileResult<()> {
        match subject {
            Subject::Host(index) => self.load_host(position, index),
            Subject::Result => {
                let (slot, width, signed) = self.result_slot()?;
                self.push(Instruction::Load(width, slot));
                if signed && width != Width::W64 {
                    self.push(Instruction::Extend(width));
                }
                Ok(())
            }
        }
    }

    fn fail(&mut self, position: usize, condition: String, error: bool) {
        let subject = Place(position).to_string();
        let index = self.asm.check(Check {
            subject,
            condition,
            handler: self.handler.clone(),
        });
        if error {
            self.push(Instruction::ErrorMake(index));
        } else {
            self.push(Instruction::Guard(index));
        }
    }

    /// Emits every assertion attached to `tag`. Returns whether any check was
    /// emitted.
    fn checks(
        &mut self,
        position: usize,
        tag: &Type,
        subject: Subject,
        signed: bool,
        error: bool,
    ) -> CompileResult<bool> {
        let test = &tag.test;
        for (symbol, argument) in [
            ('?', &test.of_format),
            (':', &test.same_type),
            ('^', &test.lifetime),
            ('~', &test.overlaps),
        ] {
            if let Some(argument) = argument {
                return Err(CompileErrorKind::UnsupportedAssertion {
                    position,
                    assertion: format!("{symbol}{argument}"),
                });
            }
        }
        let mut emitted = false;

        if let Some(bound) = &test.capacity {
            let offset = match subject {
                Subject::Host(index)
                    if matches!(self.host.args[index], HostType::Str | HostType::Bytes) =>
                {
                    self.host_offset(index)
                }
                _ => {
                    return Err(CompileErrorKind::UnsupportedAssertion {
                        position,
                        assertion: format!("[{}{}]", bound.relation.symbol(), bound.argument),
                    });
                }
            };
            let relation = match bound.relation {
                Relation::Eq => Relation::Gt,
                other => other,
            };
            self.load_reference(position, &bound.argument, 0)?;
            self.push(Instruction::SwapAssert);
            self.push(Instruction::MoveLen(offset + 8));
            self.push(Instruction::SwapLength);
            self.push(Instruction::Assert {
                relation,
                signed: false,
            });
            self.fail(position, format!("[{}{}]", bound.relation.symbol(), bound.argument), error);
            emitted = true;
        }

        for (relation, argument) in test.checks() {
            let condition = format!("{}{}{argument}", "*".repeat(test.indirect as usize), relation.symbol());
            if test.indirect > 0 {
                let element = match argument {
                    Argument::Index(index) if test.indirect == 1 => {
                        self.buffer_offset(position, *index as usize)
                            .map_err(|_| CompileErrorKind::UnsupportedAssertion {
                                position,
                                assertion: condition.clone(),
                            })?;
                        1
                    }
                    _ => {
                        return Err(CompileErrorKind::UnsupportedAssertion {
                            position,
                            assertion: condition,
                        });
                    }
                };
                let index = self.asm.data(element);
                self.push(Instruction::Data(index));
            } else {
                self.load_reference(position, argument, 0)?;
            }
            self.push(Instruction::SwapAssert);
            self.load_subject(position, subject)?;
            self.push(Instruction::Assert { relation, signed });
            if test.inverted {
                self.push(Instruction::Flip);
            }
            let condition = if test.inverted {
                format!("!{condition}")
            } else {
                condition
            };
            self.fail(position, condition, error);
            emitted = true;
        }
        Ok(emitted)
    }

    fn unmarshalable(&self, position: usize, host: &HostType) -> CompileErrorKind {
        let target = match position {
            0 => self.ty.returns().map_or_else(|| "void".to_string(), |ret| ret.to_string()),
            _ => self.params[position - 1].tag.to_string(),
        };
        CompileErrorKind::Unmarshalable {
            position,
            host: host.clone(),
            target,
        }
    }

    fn argument(&mut self, position: usize) -> CompileResult<()> {
        let param = &self.params[position - 1];
        let tag = param.tag;
        let Some(host) = param.host else {
            self.load_derived(position, 0)?;
            return self.place(position, &HostType::Usize);
        };
        let ty = self.host.args[host].clone();
        let signed = param.signed;
        self.checks(position, tag, Subject::Host(host), signed, false)?;

        let offset = self.host_offset(host);
        let pass_through = self.host_layout.args[host] == self.target.args[position - 1]
            && value_of(&ty) == self.params[position - 1].value;

        if self.params[position - 1].is_pointer_shaped() {
            let pointer = Width::W64;
            let text = self.params[position - 1].is_char();
            match (&ty, tag.free) {
                (HostType::Bytes, Some(Ownership::Borrow)) if text => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::MoveLen(offset + 8));
                    self.push(Instruction::StringMake);
                }
                (HostType::Str, Some(Ownership::Borrow)) => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::MoveLen(offset + 8));
                    self.push(Instruction::StringMake);
                }
                (HostType::Str | HostType::Bytes, Some(Ownership::Sell)) => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::MoveLen(offset + 8));
                    self.push(Instruction::StringCopy);
                }
                (HostType::Str | HostType::Bytes, Some(Ownership::Keep)) => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::MoveLen(offset + 8));
                    self.push(Instruction::PointerKeep);
                }
                (HostType::Bytes, Some(Ownership::Borrow | Ownership::Init)) => {
                    self.push(Instruction::Move(pointer, offset));
                }
                (HostType::Str | HostType::Bytes, Some(ownership)) => {
                    return Err(CompileErrorKind::UnsupportedOwnership {
                        position,
                        ownership: ownership.symbol(),
                        host: ty,
                    });
                }
                (HostType::Pointer | HostType::Callback, None) => {
                    if pass_through {
                        return Ok(());
                    }
                    self.push(Instruction::Move(pointer, offset));
                }
                (
                    HostType::Pointer | HostType::Callback,
                    Some(Ownership::Borrow | Ownership::Init | Ownership::Static),
                ) => self.push(Instruction::Move(pointer, offset)),
                (HostType::Pointer | HostType::Callback, Some(Ownership::Sell | Ownership::Free)) => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::PointerFree);
                }
                (HostType::Pointer | HostType::Callback, Some(Ownership::Keep)) => {
                    self.push(Instruction::Move(pointer, offset));
                    self.push(Instruction::PointerPin(host as u16));
                }
                _ => return Err(self.unmarshalable(position, &ty)),
            }
            return self.place(position, &ty);
        }

        let value = self.params[position - 1].value.clone();
        match (&ty, &value) {
            (HostType::Struct(_), Value::Struct(_)) if value_of(&ty) == value => {
                if pass_through {
                    return Ok(());
                }
                return self.place_struct(position, offset, &value);
            }
            (HostType::Time, _) if tag.name == "time_t" => {
                self.push(Instruction::Move(Width::W64, offset));
                self.push(Instruction::UnixTime);
            }
            (ty, value) if ty.is_integer() && !value.is_float() && !value.is_struct() => {
                if pass_through {
                    return Ok(());
                }
                self.load_host(position, host)?;
            }
            (ty, value) if ty.is_float() && value.is_float() => {
                if pass_through {
                    return Ok(());
                }
                let width = width_of(&value_of(ty));
                self.push(Instruction::Move(width, offset));
                match (ty, value) {
                    (HostType::F32, Value::Float8) => self.push(Instruction::Widen),
                    (HostType::F64, Value::Float4) => self.push(Instruction::Narrow),
                    _ => {}
                }
            }
            (ty, _) => return Err(self.unmarshalable(position, ty)),
        }
        self.place(position, &ty)
    }

    /// Writes `$normal` into the target location of C argument `position`.
    fn place(&mut self, position: usize, host: &HostType) -> CompileResult<()> {
        let param = &self.params[position - 1];
        let width = width_of(&param.value);
        let narrow_signed = param.signed && param.value.size() < 4;
        match &self.target.args[position - 1] {
            Location::Empty => {}
            Location::Hardware(hardware @ Hardware::Register(_)) if narrow_signed => {
                let hardware = *hardware;
                self.push(Instruction::Extend(width));
                self.push(Instruction::Copy(Width::W32, slot(hardware)));
            }
            Location::Hardware(hardware) => {
                let hardware = *hardware;
                self.push(Instruction::Copy(width, slot(hardware)));
            }
            _ => return Err(self.unmarshalable(position, host)),
        }
        Ok(())
    }

    fn place_struct(&mut self, position: usize, offset: u32, value: &Value) -> CompileResult<()> {
        match self.target.args[position - 1].clone() {
            Location::Empty => {}
            Location::Multiple(parts) => {
                for part in parts {
                    let width = Width::covering(part.size);
                    self.push(Instruction::Move(width, offset + part.offset as u32));
                    self.push(Instruction::Copy(width, slot(part.hardware)));
                }
            }
            Location::Hardware(Hardware::StackRtl(target)) => {
                self.push(Instruction::HeapMake);
                self.push(Instruction::HostCopy {
                    offset,
                    size: value.size() as u32,
                });
                self.push(Instruction::HeapLoad);
                self.push(Instruction::StackCopy(target as u32));
            }
            Location::Indirect { pointer, .. } => {
                self.push(Instruction::HeapMake);
                self.push(Instruction::HostCopy {
                    offset,
                    size: value.size() as u32,
                });
                self.push(Instruction::HeapLoad);
                self.push(Instruction::Copy(Width::W64, slot(pointer)));
            }
            _ => {
                let host = self.host.args[self.params[position - 1].host.unwrap_or_default()].clone();
                return Err(self.unmarshalable(position, &host));
            }
        }
        Ok(())
    }

    fn result(&mut self) -> CompileResult<()> {
        let host = self.host.rets.first().cloned().unwrap_or(HostType::Unit);
        if self.ret.is_none() {
            if host != HostType::Unit {
                return Err(self.unmarshalable(0, &host));
            }
            self.push(Instruction::Return(ReturnKind::Unit));
            return Ok(());
        }
        let (tag, signed, value, is_char, pointer_shaped) = match &self.ret {
            Some(ret) => (
                ret.tag,
                ret.signed,
                ret.value.clone(),
                ret.is_char(),
                ret.is_pointer_shaped(),
            ),
            None => return Ok(()),
        };

        match &host {
            HostType::Unit => {
                self.checks(0, tag, Subject::Result, signed, false)?;
                self.push(Instruction::Return(ReturnKind::Unit));
            }
            HostType::Error => {
                if value.is_float() || value.is_struct() {
                    return Err(self.unmarshalable(0, &host));
                }
                if !self.checks(0, tag, Subject::Result, signed, true)? {
                    return Err(CompileErrorKind::MissingErrorAssertion);
                }
                self.push(Instruction::Return(ReturnKind::Error));
            }
            HostType::Str => {
                let kind = match tag.free {
                    _ if !is_char => return Err(self.unmarshalable(0, &host)),
                    Some(Ownership::Sell) => ReturnKind::StrFree,
                    Some(Ownership::Borrow | Ownership::Static) => ReturnKind::Str,
                    Some(ownership) => {
                        return Err(CompileErrorKind::UnsupportedOwnership {
                            position: 0,
                            ownership: ownership.symbol(),
                            host,
                        });
                    }
                    None => return Err(self.unmarshalable(0, &host)),
                };
                self.checks(0, tag, Subject::Result, false, false)?;
                let (slot, _, _) = self.result_slot()?;
                self.push(Instruction::Load(Width::W64, slot));
                self.push(Instruction::StringSize);
                self.push(Instruction::Return(kind));
            }
            HostType::Pointer => {
                if value != Value::Memory {
                    return Err(self.unmarshalable(0, &host));
                }
                self.checks(0, tag, Subject::Result, false, false)?;
                let (slot, _, _) = self.result_slot()?;
                self.push(Instruction::Load(Width::W64, slot));
                if tag.free == Some(Ownership::Sell) {
                    self.push(Instruction::PointerPin(PIN_NO_SOURCE));
                }
                self.push(Instruction::Return(ReturnKind::Scalar));
            }
            HostType::Struct(_) => {
                if value_of(&host) != value {
                    return Err(self.unmarshalable(0, &host));
                }
                if !tag.test.is_empty() {
                    return Err(CompileErrorKind::UnsupportedAssertion {
                        position: 0,
                        assertion: "on aggregate".to_string(),
                    });
                }
                self.result_struct(&value)?;
                self.push(Instruction::Return(ReturnKind::Image));
            }
            host_ty if pointer_shaped => return Err(self.unmarshalable(0, host_ty)),
            HostType::Time if tag.name == "time_t" => {
                self.checks(0, tag, Subject::Result, signed, false)?;
                let (slot, _, _) = self.result_slot()?;
                self.push(Instruction::Load(Width::W64, slot));
                self.push(Instruction::Return(ReturnKind::Scalar));
            }
            host_ty if host_ty.is_integer() && !value.is_float() && !value.is_struct() => {
                self.checks(0, tag, Subject::Result, signed, false)?;
                let (slot, width, _) = self.result_slot()?;
                self.push(Instruction::Load(width, slot));
                if signed && width != Width::W64 {
                    self.push(Instruction::Extend(width));
                }
                self.push(Instruction::Return(ReturnKind::Scalar));
            }
            host_ty if host_ty.is_float() && value.is_float() => {
                self.checks(0, tag, Subject::Result, signed, false)?;
                let (slot, width, _) = self.result_slot()?;
                self.push(Instruction::Load(width, slot));
                match (host_ty, &value) {
                    (HostType::F64, Value::Float4) => self.push(Instruction::Widen),
                    (HostType::F32, Value::Float8) => self.push(Instruction::Narrow),
                    _ => {}
                }
                self.push(Instruction::Return(ReturnKind::Scalar));
            }
            host_ty => return Err(self.unmarshalable(0, host_ty)),
        }
        Ok(())
    }

    fn result_struct(&mut self, value: &Value) -> CompileResult<()> {
        self.push(Instruction::HeapMake);
        match self.target.rets.first().cloned() {
            Some(Location::Multiple(parts)) => {
                for part in parts {
                    let width = Width::covering(part.size);
                    self.push(Instruction::Load(width, slot(part.hardware)));
                    self.push(Instruction::HeapPut(width, part.offset as u32));
                }
            }
            Some(Location::Hardware(Hardware::StackRtl(base))) => {
                for (offset, leaf) in value.leaves() {
                    let width = width_of(&leaf);
                    self.push(Instruction::Load(width, Slot::Stack((base + offset) as u32)));
                    self.push(Instruction::HeapPut(width, offset as u32));
                }
            }
            _ => {
                return Err(CompileErrorKind::Resolve(ResolveError::UnsupportedAggregate {
                    size: value.size(),
                }));
            }
        }
        self.push(Instruction::HeapLoad);
        Ok(())
    }
}
