#![allow(dead_code, unused_imports)]

pub use link::program::{Instruction, ReturnKind, Slot, Width};
pub use link::tag::parse;
pub use link::{
    CallError, Callback, CompileError, CompileErrorKind, Compiler, DispatchMode, HostSignature,
    HostType, HostValue, LinkConfig, NativeError, Program, direct_dispatch_supported, leases,
    make_callback,
};
pub use std::sync::Arc;

pub fn config(dispatch: DispatchMode) -> LinkConfig {
    LinkConfig {
        dispatch,
        ..LinkConfig::default()
    }
}

/// Every dispatch strategy the build target can run.
pub fn strategies() -> Vec<DispatchMode> {
    let mut modes = vec![DispatchMode::Generic];
    if direct_dispatch_supported() {
        modes.push(DispatchMode::Direct);
    }
    modes
}

pub fn link_with(mode: DispatchMode, tag: &str, address: usize) -> Program {
    Compiler::new(config(mode))
        .link(tag, address)
        .expect("tag should compile")
}

pub fn compile_with(mode: DispatchMode, tag: &str, address: usize, host: HostSignature) -> Program {
    let (symbols, ty) = parse(tag).expect("tag should parse");
    Compiler::new(config(mode))
        .compile(&symbols[0], address, &ty, &host)
        .expect("tag should compile")
}

/// A temporary C stream holding `contents`, rewound to the start.
pub fn stream(contents: &[u8]) -> *mut libc::FILE {
    unsafe {
        let file = libc::tmpfile();
        assert!(!file.is_null(), "tmpfile failed");
        let written = libc::fwrite(contents.as_ptr().cast(), 1, contents.len(), file);
        assert_eq!(written, contents.len());
        libc::rewind(file);
        file
    }
}

pub fn close(file: *mut libc::FILE) {
    unsafe {
        libc::fclose(file);
    }
}

pub extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

pub extern "C" fn identity_i8(value: i8) -> i8 {
    value
}

pub extern "C" fn identity_u16(value: u16) -> u16 {
    value
}

pub extern "C" fn identity_i32(value: i32) -> i32 {
    value
}

pub extern "C" fn identity_u64(value: u64) -> u64 {
    value
}

pub extern "C" fn identity_f32(value: f32) -> f32 {
    value
}

pub extern "C" fn identity_f64(value: f64) -> f64 {
    value
}

pub extern "C" fn mix(a: f32, b: f64, c: i64) -> f64 {
    a as f64 * b + c as f64
}

pub extern "C" fn weighted(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
    i: i64,
    j: i64,
) -> i64 {
    a + b * 2 + c * 3 + d * 4 + e * 5 + f * 6 + g * 7 + h * 8 + i * 9 + j * 10
}
