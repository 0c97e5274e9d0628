//! Native entry points backed by host closures.

use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use libffi::low;
use libffi::middle::{Cif, Closure, Type};
use link_abi::Value;
use tracing::warn;

use crate::compiler::{CompileError, CompileErrorKind};
use crate::ctype::{self, CKind};
use crate::host::{HostSignature, HostType, HostValue, scalar_from_bits};
use crate::tag::Type as Tag;
use crate::vm::dispatch::ffi_type;

pub type HostFunction = Arc<dyn Fn(&[HostValue]) -> HostValue + Send + Sync>;

const SYMBOL: &str = "callback";

enum ArgShape {
    Integer { size: usize, signed: bool, host: HostType },
    Float { size: usize, host: HostType },
    Str,
}

impl ArgShape {
    /// # Safety
    ///
    /// `pointer` must address a value of this shape.
    unsafe fn read(&self, pointer: *const c_void) -> HostValue {
        match self {
            ArgShape::Integer { size, signed, host } => {
                let bits = unsafe { read_bits(pointer, *size) };
                let bits = if *signed { sign_extend(bits, *size) } else { bits };
                scalar_from_bits(host, bits).unwrap_or(HostValue::Unit)
            }
            ArgShape::Float { size, host } => {
                let value = if *size == 4 {
                    unsafe { *(pointer as *const f32) as f64 }
                } else {
                    unsafe { *(pointer as *const f64) }
                };
                match host {
                    HostType::F32 => HostValue::F32(value as f32),
                    _ => HostValue::F64(value),
                }
            }
            ArgShape::Str => {
                let text = unsafe { *(pointer as *const *const c_char) };
                if text.is_null() {
                    return HostValue::Str(String::new());
                }
                let text = unsafe { CStr::from_ptr(text) };
                HostValue::Str(text.to_string_lossy().into_owned())
            }
        }
    }
}

enum RetShape {
    Void,
    Integer,
    Float4,
    Float8,
}

impl RetShape {
    fn encode(&self, value: &HostValue) -> u64 {
        match (self, value) {
            (RetShape::Void, _) => 0,
            (RetShape::Float4, HostValue::F32(value)) => value.to_bits() as u64,
            (RetShape::Float4, HostValue::F64(value)) => (*value as f32).to_bits() as u64,
            (RetShape::Float8, HostValue::F64(value)) => value.to_bits(),
            (RetShape::Float8, HostValue::F32(value)) => (*value as f64).to_bits(),
            (RetShape::Integer, value) => value.as_i64().unwrap_or(0) as u64,
            _ => 0,
        }
    }
}

unsafe fn read_bits(pointer: *const c_void, size: usize) -> u64 {
    unsafe {
        match size {
            1 => *(pointer as *const u8) as u64,
            2 => *(pointer as *const u16) as u64,
            4 => *(pointer as *const u32) as u64,
            _ => *(pointer as *const u64),
        }
    }
}

fn sign_extend(bits: u64, size: usize) -> u64 {
    match size {
        1 => bits as u8 as i8 as i64 as u64,
        2 => bits as u16 as i16 as i64 as u64,
        4 => bits as u32 as i32 as i64 as u64,
        _ => bits,
    }
}

struct CallbackState {
    function: HostFunction,
    args: Vec<ArgShape>,
    ret: RetShape,
}

unsafe extern "C" fn entry(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    state: &CallbackState,
) {
    let mut values = Vec::with_capacity(state.args.len());
    for (index, shape) in state.args.iter().enumerate() {
        let pointer = unsafe { *args.add(index) };
        values.push(unsafe { shape.read(pointer) });
    }
    match panic::catch_unwind(AssertUnwindSafe(|| (state.function)(&values))) {
        Ok(value) => *result = state.ret.encode(&value),
        Err(_) => {
            warn!("host callback panicked, returning zero to native code");
            *result = 0;
        }
    }
}

struct Inner {
    closure: ManuallyDrop<Closure<'static>>,
    state: *mut CallbackState,
    address: usize,
}

// The closure only reads its state, and the host function is Send + Sync.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.state));
        }
    }
}

/// A native function pointer that calls back into a host closure. The entry
/// point stays valid until the last clone is dropped.
#[derive(Clone)]
pub struct Callback(Arc<Inner>);

impl Callback {
    pub fn address(&self) -> usize {
        self.0.address
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback(0x{:x})", self.address())
    }
}

fn error(kind: CompileErrorKind) -> CompileError {
    CompileError {
        symbol: SYMBOL.to_string(),
        kind,
    }
}

fn c_shape(ty: &Tag) -> Result<(Value, CKind, bool), CompileErrorKind> {
    if ty.is_func() {
        return Ok((Value::Memory, CKind::Opaque, false));
    }
    let Some(c) = ctype::lookup(&ty.name) else {
        return Err(CompileErrorKind::UnknownType(ty.name.clone()));
    };
    if ty.free.is_some() {
        return Ok((Value::Memory, c.kind, false));
    }
    if c.needs_marker() {
        return Err(CompileErrorKind::MissingMarker(ty.name.clone()));
    }
    let signed = c.is_signed();
    Ok((c.value, c.kind, signed))
}

fn arg_shape(position: usize, ty: &Tag, host: &HostType) -> Result<(ArgShape, Type), CompileErrorKind> {
    let (value, kind, signed) = c_shape(ty)?;
    let unmarshalable = || CompileErrorKind::Unmarshalable {
        position,
        host: host.clone(),
        target: ty.to_string(),
    };
    let shape = match (&value, host) {
        (Value::Struct(_), _) | (_, HostType::Struct(_)) => return Err(unmarshalable()),
        (Value::Memory, HostType::Str) if kind == CKind::Char => ArgShape::Str,
        (Value::Float4 | Value::Float8, host) if host.is_float() => ArgShape::Float {
            size: value.size(),
            host: host.clone(),
        },
        (Value::Memory, HostType::Pointer) => ArgShape::Integer {
            size: 8,
            signed: false,
            host: HostType::Pointer,
        },
        (_, HostType::Time) if ty.name == "time_t" => ArgShape::Integer {
            size: 8,
            signed: true,
            host: HostType::Time,
        },
        (value, host) if host.is_integer() && !value.is_float() && *value != Value::Memory => {
            ArgShape::Integer {
                size: value.size(),
                signed,
                host: host.clone(),
            }
        }
        _ => return Err(unmarshalable()),
    };
    Ok((shape, ffi_type(&value, signed)))
}

fn ret_shape(ty: Option<&Tag>, host: Option<&HostType>) -> Result<(RetShape, Type), CompileErrorKind> {
    let Some(ty) = ty else {
        return Ok((RetShape::Void, Type::void()));
    };
    let (value, _, signed) = c_shape(ty)?;
    let unmarshalable = |host: &HostType| CompileErrorKind::Unmarshalable {
        position: 0,
        host: host.clone(),
        target: ty.to_string(),
    };
    let shape = match (&value, host) {
        (Value::Bytes0, _) | (_, None) => RetShape::Void,
        (Value::Struct(_), Some(host)) => return Err(unmarshalable(host)),
        (Value::Float4, Some(host)) if host.is_float() => RetShape::Float4,
        (Value::Float8, Some(host)) if host.is_float() => RetShape::Float8,
        (value, Some(host))
            if !value.is_float() && (host.is_integer() || *host == HostType::Pointer) =>
        {
            RetShape::Integer
        }
        (_, Some(host)) => return Err(unmarshalable(host)),
    };
    Ok((shape, ffi_type(&value, signed)))
}

/// Builds a native entry point with the C signature of `ty` that converts its
/// arguments per `signature`, runs `function` and hands the result back.
pub fn make_callback(
    function: HostFunction,
    ty: &Tag,
    signature: &HostSignature,
) -> Result<Callback, CompileError> {
    if !ty.is_func() {
        return Err(error(CompileErrorKind::NotAFunction(ty.name.clone())));
    }
    if ty.more {
        return Err(error(CompileErrorKind::Variadic));
    }
    if signature.args.len() != ty.args.len() {
        return Err(error(CompileErrorKind::ArgumentCount {
            expected: ty.args.len(),
            got: signature.args.len(),
        }));
    }
    if signature.rets.len() > 1 {
        return Err(error(CompileErrorKind::ReturnArity(signature.rets.len())));
    }

    let mut shapes = Vec::with_capacity(ty.args.len());
    let mut types = Vec::with_capacity(ty.args.len());
    for (index, (arg, host)) in ty.args.iter().zip(&signature.args).enumerate() {
        let (shape, ffi) = arg_shape(index + 1, arg, host).map_err(error)?;
        shapes.push(shape);
        types.push(ffi);
    }
    let (ret, ret_type) = ret_shape(ty.returns(), signature.rets.first()).map_err(error)?;

    let cif = Cif::new(types, ret_type);
    let state = Box::into_raw(Box::new(CallbackState {
        function,
        args: shapes,
        ret,
    }));
    let userdata: &'static CallbackState = unsafe { &*state };
    let closure = Closure::new(cif, entry, userdata);
    let address = *closure.code_ptr() as usize;
    Ok(Callback(Arc::new(Inner {
        closure: ManuallyDrop::new(closure),
        state,
        address,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::parse;

    #[test]
    fn closure_is_callable_from_native_code() {
        let (_, ty) = parse("twice func(int)int").expect("parse");
        let sig = HostSignature::new(vec![HostType::I32], vec![HostType::I32]);
        let callback = make_callback(
            Arc::new(|args: &[HostValue]| match args {
                [HostValue::I32(value)] => HostValue::I32(value * 2),
                _ => HostValue::I32(-1),
            }),
            &ty,
            &sig,
        )
        .expect("callback");
        let native: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(callback.address()) };
        assert_eq!(native(-21), -42);
    }

    #[test]
    fn strings_and_doubles_reach_the_host() {
        let (_, ty) = parse("score func(&char,double)double").expect("parse");
        let sig = HostSignature::new(vec![HostType::Str, HostType::F64], vec![HostType::F64]);
        let callback = make_callback(
            Arc::new(|args: &[HostValue]| match args {
                [HostValue::Str(text), HostValue::F64(weight)] => {
                    HostValue::F64(text.len() as f64 * weight)
                }
                _ => HostValue::F64(-1.0),
            }),
            &ty,
            &sig,
        )
        .expect("callback");
        let native: extern "C" fn(*const c_char, f64) -> f64 =
            unsafe { std::mem::transmute(callback.address()) };
        assert_eq!(native(c"abcd".as_ptr(), 0.5), 2.0);
    }

    #[test]
    fn pointers_arrive_as_addresses() {
        let (_, ty) = parse("next func(&void)uintptr_t").expect("parse");
        let sig = HostSignature::new(vec![HostType::Pointer], vec![HostType::Usize]);
        let callback = make_callback(
            Arc::new(|args: &[HostValue]| match args {
                [HostValue::Pointer(address)] => HostValue::Usize(address + 8),
                _ => HostValue::Usize(0),
            }),
            &ty,
            &sig,
        )
        .expect("callback");
        let native: extern "C" fn(*const c_void) -> usize =
            unsafe { std::mem::transmute(callback.address()) };
        assert_eq!(native(0x1000 as *const c_void), 0x1008);
    }

    #[test]
    fn void_callbacks_run_for_their_effect() {
        use std::sync::atomic::{AtomicI32, Ordering};

        let seen = Arc::new(AtomicI32::new(0));
        let recorded = Arc::clone(&seen);
        let (_, ty) = parse("note func(int)void").expect("parse");
        let sig = HostSignature::new(vec![HostType::I32], vec![]);
        let callback = make_callback(
            Arc::new(move |args: &[HostValue]| {
                if let [HostValue::I32(value)] = args {
                    recorded.store(*value, Ordering::SeqCst);
                }
                HostValue::Unit
            }),
            &ty,
            &sig,
        )
        .expect("callback");
        let native: extern "C" fn(i32) = unsafe { std::mem::transmute(callback.address()) };
        native(-17);
        assert_eq!(seen.load(Ordering::SeqCst), -17);
    }

    #[test]
    fn host_panics_return_zero_to_native_code() {
        let (_, ty) = parse("boom func(int)int").expect("parse");
        let sig = HostSignature::new(vec![HostType::I32], vec![HostType::I32]);
        let callback = make_callback(
            Arc::new(|_: &[HostValue]| -> HostValue { panic!("host failure") }),
            &ty,
            &sig,
        )
        .expect("callback");
        let native: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(callback.address()) };
        assert_eq!(native(5), 0);
    }

    #[test]
    fn aggregates_are_rejected() {
        let (_, ty) = parse("cb func(div_t)void").expect("parse");
        let sig = HostSignature::new(vec![HostType::Struct(vec![HostType::I32, HostType::I32])], vec![]);
        let err = make_callback(Arc::new(|_: &[HostValue]| HostValue::Unit), &ty, &sig)
            .expect_err("aggregate");
        assert!(matches!(err.kind, CompileErrorKind::Unmarshalable { position: 1, .. }));
    }
}
