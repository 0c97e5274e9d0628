//! Calls C functions described by a compact tag such as
//! `strlen func(&char)size_t`, with ownership and safety assertions compiled
//! into a small marshaling program.

pub mod assembler;
pub mod cache;
pub mod callback;
pub mod compiler;
pub mod config;
pub mod ctype;
pub mod host;
pub mod lease;
pub mod logging;
pub mod program;
pub mod tag;
pub mod vm;

pub use callback::{Callback, HostFunction, make_callback};
pub use compiler::{CompileError, CompileErrorKind, Compiler, compile, link};
pub use config::{DispatchMode, LinkConfig, direct_dispatch_supported};
pub use host::{HostSignature, HostType, HostValue, NativeError};
pub use lease::{LeaseTable, leases};
pub use program::Program;
pub use vm::{CallError, CallResult};
