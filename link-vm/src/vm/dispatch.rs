//! Portable dispatch through libffi. Arguments are read straight out of the
//! target stack image the program filled, the result is written back into its
//! slot in the same image.

use std::ffi::c_void;
use std::fmt;

use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;
use link_abi::Value;

pub struct GenericCall {
    cif: Cif,
}

// The CIF is only read after construction.
unsafe impl Send for GenericCall {}
unsafe impl Sync for GenericCall {}

impl Clone for GenericCall {
    fn clone(&self) -> Self {
        Self {
            cif: self.cif.clone(),
        }
    }
}

impl fmt::Debug for GenericCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericCall").finish_non_exhaustive()
    }
}

impl GenericCall {
    /// `args` and `ret` pair each C shape with its signedness.
    pub fn new(args: &[(Value, bool)], ret: Option<&(Value, bool)>) -> Self {
        let ret = match ret {
            Some((value, signed)) => ffi_type(value, *signed),
            None => Type::void(),
        };
        Self {
            cif: Cif::new(args.iter().map(|(value, signed)| ffi_type(value, *signed)), ret),
        }
    }

    /// # Safety
    ///
    /// `function` must be a native function matching the CIF, every pointer
    /// in `args` must address a value of the matching shape and `result` must
    /// have room for the return value widened to a word.
    pub(crate) unsafe fn call(&self, function: usize, args: &mut [*mut c_void], result: *mut c_void) {
        let code = CodePtr(function as *mut c_void);
        unsafe {
            raw::ffi_call(
                self.cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                result,
                args.as_mut_ptr(),
            );
        }
    }
}

pub(crate) fn ffi_type(value: &Value, signed: bool) -> Type {
    match (value, signed) {
        (Value::Bytes0, _) => Type::void(),
        (Value::Bytes1, true) => Type::i8(),
        (Value::Bytes1, false) => Type::u8(),
        (Value::Bytes2, true) => Type::i16(),
        (Value::Bytes2, false) => Type::u16(),
        (Value::Bytes4, true) => Type::i32(),
        (Value::Bytes4, false) => Type::u32(),
        (Value::Bytes8, true) => Type::i64(),
        (Value::Bytes8, false) => Type::u64(),
        (Value::Sizing, true) => Type::isize(),
        (Value::Sizing, false) => Type::usize(),
        (Value::Float4, _) => Type::f32(),
        (Value::Float8, _) => Type::f64(),
        (Value::Memory, _) => Type::pointer(),
        (Value::Struct(fields), _) => {
            Type::structure(fields.iter().map(|field| ffi_type(field, true)))
        }
    }
}
