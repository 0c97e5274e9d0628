//! C type names understood by tags, with their LP64 shapes, and the named
//! platform constants assertions may reference.

use link_abi::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CKind {
    Void,
    Bool,
    Signed,
    Unsigned,
    Float,
    /// Plain `char`, signedness follows the platform.
    Char,
    /// Only usable behind an ownership marker.
    Opaque,
    Struct,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CType {
    pub value: Value,
    pub kind: CKind,
}

impl CType {
    fn new(value: Value, kind: CKind) -> Self {
        Self { value, kind }
    }

    pub fn is_signed(&self) -> bool {
        match self.kind {
            CKind::Signed => true,
            CKind::Char => CHAR_IS_SIGNED,
            _ => false,
        }
    }

    pub fn needs_marker(&self) -> bool {
        matches!(self.kind, CKind::Char | CKind::Opaque)
    }
}

pub const CHAR_IS_SIGNED: bool = (std::ffi::c_char::MIN as i32) < 0;

const WCHAR_IS_SIGNED: bool = cfg!(not(all(target_arch = "aarch64", target_os = "linux")));

// int_fast16_t and int_fast32_t are a full word on glibc, natural width elsewhere.
const FAST_WIDE: bool = cfg!(target_os = "linux");

pub fn lookup(name: &str) -> Option<CType> {
    use CKind::*;

    let fast16 = if FAST_WIDE { Value::Bytes8 } else { Value::Bytes2 };
    let fast32 = if FAST_WIDE { Value::Bytes8 } else { Value::Bytes4 };
    let wchar = if WCHAR_IS_SIGNED { Signed } else { Unsigned };
    let ty = match name {
        "void" => CType::new(Value::Bytes0, Void),
        "bool" | "_Bool" => CType::new(Value::Bytes1, Bool),
        "char" => CType::new(Value::Bytes1, Char),
        "signed_char" | "int8_t" | "int_least8_t" | "int_fast8_t" => {
            CType::new(Value::Bytes1, Signed)
        }
        "unsigned_char" | "uint8_t" | "uint_least8_t" | "uint_fast8_t" => {
            CType::new(Value::Bytes1, Unsigned)
        }
        "short" | "int16_t" | "int_least16_t" => CType::new(Value::Bytes2, Signed),
        "unsigned_short" | "uint16_t" | "uint_least16_t" | "char16_t" => {
            CType::new(Value::Bytes2, Unsigned)
        }
        "int_fast16_t" => CType::new(fast16, Signed),
        "uint_fast16_t" => CType::new(fast16, Unsigned),
        "int" | "int32_t" | "int_least32_t" | "sig_atomic_t" => CType::new(Value::Bytes4, Signed),
        "unsigned_int" | "uint32_t" | "uint_least32_t" | "char32_t" | "wint_t" => {
            CType::new(Value::Bytes4, Unsigned)
        }
        "int_fast32_t" => CType::new(fast32, Signed),
        "uint_fast32_t" => CType::new(fast32, Unsigned),
        "wchar_t" => CType::new(Value::Bytes4, wchar),
        "long" | "longlong" | "int64_t" | "int_least64_t" | "int_fast64_t" | "intmax_t"
        | "off_t" | "time_t" | "clock_t" => CType::new(Value::Bytes8, Signed),
        "unsigned_long" | "unsigned_longlong" | "uint64_t" | "uint_least64_t"
        | "uint_fast64_t" | "uintmax_t" => CType::new(Value::Bytes8, Unsigned),
        "size_t" | "uintptr_t" => CType::new(Value::Sizing, Unsigned),
        "ssize_t" | "intptr_t" | "ptrdiff_t" => CType::new(Value::Sizing, Signed),
        "float" | "float_t" => CType::new(Value::Float4, Float),
        "double" | "double_t" => CType::new(Value::Float8, Float),
        "FILE" | "fpos_t" => CType::new(Value::Memory, Opaque),
        "div_t" => CType::new(Value::Struct(vec![Value::Bytes4, Value::Bytes4]), Struct),
        "ldiv_t" | "lldiv_t" => CType::new(Value::Struct(vec![Value::Bytes8, Value::Bytes8]), Struct),
        _ => return None,
    };
    Some(ty)
}

#[cfg(target_os = "macos")]
const BUFSIZ: i64 = 1024;
#[cfg(not(target_os = "macos"))]
const BUFSIZ: i64 = 8192;

#[cfg(target_os = "macos")]
const FILENAME_MAX: i64 = 1024;
#[cfg(not(target_os = "macos"))]
const FILENAME_MAX: i64 = 4096;

#[cfg(target_os = "macos")]
const FOPEN_MAX: i64 = 20;
#[cfg(not(target_os = "macos"))]
const FOPEN_MAX: i64 = 16;

/// Resolves a named platform constant. Unsigned limits that do not fit an
/// `i64` are returned as their two's complement bit pattern.
pub fn constant(name: &str) -> Option<i64> {
    let (char_min, char_max) = if CHAR_IS_SIGNED {
        (i8::MIN as i64, i8::MAX as i64)
    } else {
        (0, u8::MAX as i64)
    };
    let value = match name {
        "NULL" | "false" => 0,
        "true" => 1,
        "CHAR_BIT" => 8,
        "SCHAR_MIN" => i8::MIN as i64,
        "SCHAR_MAX" => i8::MAX as i64,
        "UCHAR_MAX" => u8::MAX as i64,
        "CHAR_MIN" => char_min,
        "CHAR_MAX" => char_max,
        "SHRT_MIN" => i16::MIN as i64,
        "SHRT_MAX" => i16::MAX as i64,
        "USHRT_MAX" => u16::MAX as i64,
        "INT_MIN" => i32::MIN as i64,
        "INT_MAX" => i32::MAX as i64,
        "UINT_MAX" => u32::MAX as i64,
        "LONG_MIN" | "LLONG_MIN" | "INT64_MIN" | "INTMAX_MIN" | "PTRDIFF_MIN" => i64::MIN,
        "LONG_MAX" | "LLONG_MAX" | "INT64_MAX" | "INTMAX_MAX" | "PTRDIFF_MAX" | "SSIZE_MAX" => {
            i64::MAX
        }
        "ULONG_MAX" | "ULLONG_MAX" | "UINT64_MAX" | "UINTMAX_MAX" | "SIZE_MAX" => u64::MAX as i64,
        "INT8_MIN" => i8::MIN as i64,
        "INT8_MAX" => i8::MAX as i64,
        "UINT8_MAX" => u8::MAX as i64,
        "INT16_MIN" => i16::MIN as i64,
        "INT16_MAX" => i16::MAX as i64,
        "UINT16_MAX" => u16::MAX as i64,
        "INT32_MIN" => i32::MIN as i64,
        "INT32_MAX" => i32::MAX as i64,
        "UINT32_MAX" => u32::MAX as i64,
        "EOF" => -1,
        "BUFSIZ" => BUFSIZ,
        "FILENAME_MAX" => FILENAME_MAX,
        "FOPEN_MAX" => FOPEN_MAX,
        "RAND_MAX" => i32::MAX as i64,
        "SEEK_SET" => libc::SEEK_SET as i64,
        "SEEK_CUR" => libc::SEEK_CUR as i64,
        "SEEK_END" => libc::SEEK_END as i64,
        "_IOFBF" => 0,
        "_IOLBF" => 1,
        "_IONBF" => 2,
        "EXIT_SUCCESS" => libc::EXIT_SUCCESS as i64,
        "EXIT_FAILURE" => libc::EXIT_FAILURE as i64,
        "EPERM" => libc::EPERM as i64,
        "ENOENT" => libc::ENOENT as i64,
        "EINTR" => libc::EINTR as i64,
        "EIO" => libc::EIO as i64,
        "EBADF" => libc::EBADF as i64,
        "EAGAIN" => libc::EAGAIN as i64,
        "ENOMEM" => libc::ENOMEM as i64,
        "EACCES" => libc::EACCES as i64,
        "EEXIST" => libc::EEXIST as i64,
        "EINVAL" => libc::EINVAL as i64,
        "ENOSPC" => libc::ENOSPC as i64,
        "EPIPE" => libc::EPIPE as i64,
        "EDOM" => libc::EDOM as i64,
        "ERANGE" => libc::ERANGE as i64,
        "SIGABRT" => libc::SIGABRT as i64,
        "SIGFPE" => libc::SIGFPE as i64,
        "SIGILL" => libc::SIGILL as i64,
        "SIGINT" => libc::SIGINT as i64,
        "SIGSEGV" => libc::SIGSEGV as i64,
        "SIGTERM" => libc::SIGTERM as i64,
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_names_follow_lp64() {
        assert_eq!(lookup("int").map(|ty| ty.value), Some(Value::Bytes4));
        assert_eq!(lookup("long").map(|ty| ty.value), Some(Value::Bytes8));
        assert_eq!(lookup("size_t").map(|ty| ty.value), Some(Value::Sizing));
        assert_eq!(lookup("unsigned_short").map(|ty| ty.is_signed()), Some(false));
        assert!(lookup("ssize_t").is_some_and(|ty| ty.is_signed()));
        assert!(lookup("struct_tm").is_none());
    }

    #[test]
    fn div_t_matches_libc_layout() {
        #[repr(C)]
        struct Div {
            _quot: libc::c_int,
            _rem: libc::c_int,
        }
        let div = lookup("div_t").expect("div_t");
        assert_eq!(div.value.size(), std::mem::size_of::<Div>());
        assert_eq!(div.kind, CKind::Struct);
    }

    #[test]
    fn char_and_handles_need_a_marker() {
        assert!(lookup("char").is_some_and(|ty| ty.needs_marker()));
        assert!(lookup("FILE").is_some_and(|ty| ty.needs_marker()));
        assert!(!lookup("int").is_some_and(|ty| ty.needs_marker()));
    }

    #[test]
    fn constants_resolve() {
        assert_eq!(constant("EOF"), Some(-1));
        assert_eq!(constant("INT_MAX"), Some(i32::MAX as i64));
        assert_eq!(constant("SIZE_MAX"), Some(-1));
        assert_eq!(constant("SEEK_END"), Some(libc::SEEK_END as i64));
        assert_eq!(constant("NOT_A_CONSTANT"), None);
    }
}
