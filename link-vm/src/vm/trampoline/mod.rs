//! Register-level entry points. A trampoline takes a [`NativeFrame`], copies
//! the stack image onto the machine stack, loads argument registers, calls the
//! function and stores the result registers back into the frame.

use std::sync::OnceLock;

#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64;

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
mod aarch64;

pub(crate) const FRAME_REGISTERS: usize = 8;

/// Shared with the machine code, field offsets are fixed.
#[repr(C)]
pub(crate) struct NativeFrame {
    pub function: u64,
    pub stack: *const u64,
    /// Always even so the callee sees a 16 byte aligned stack.
    pub stack_words: u64,
    pub gpr: [u64; FRAME_REGISTERS],
    pub fpr: [u64; FRAME_REGISTERS],
}

impl NativeFrame {
    pub(crate) fn new(function: usize) -> Self {
        Self {
            function: function as u64,
            stack: std::ptr::null(),
            stack_words: 0,
            gpr: [0; FRAME_REGISTERS],
            fpr: [0; FRAME_REGISTERS],
        }
    }
}

pub(super) trait NativeBackend {
    fn machine_code() -> Vec<u8>;
    fn write_machine_code(ptr: *mut u8, code: &[u8]) -> Result<(), String>;
}

#[cfg(all(target_arch = "x86_64", unix))]
type ActiveBackend = x86_64::X86_64Backend;

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
type ActiveBackend = aarch64::Aarch64Backend;

type Entry = unsafe extern "C" fn(*mut NativeFrame);

pub(crate) struct Trampoline {
    _memory: ExecutableMemory,
    entry: Entry,
}

static TRAMPOLINE: OnceLock<Result<Trampoline, String>> = OnceLock::new();

impl Trampoline {
    /// Maps the entry point for the build target once per process.
    pub(crate) fn prepare() -> Result<&'static Trampoline, String> {
        TRAMPOLINE
            .get_or_init(Trampoline::build)
            .as_ref()
            .map_err(Clone::clone)
    }

    #[cfg(any(
        all(target_arch = "x86_64", unix),
        all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
    ))]
    fn build() -> Result<Trampoline, String> {
        let code = ActiveBackend::machine_code();
        let memory = ExecutableMemory::from_code(&code)?;
        let entry = unsafe { std::mem::transmute::<*mut u8, Entry>(memory.ptr) };
        Ok(Trampoline {
            _memory: memory,
            entry,
        })
    }

    #[cfg(not(any(
        all(target_arch = "x86_64", unix),
        all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
    )))]
    fn build() -> Result<Trampoline, String> {
        Err("no trampoline for this target".to_string())
    }

    /// # Safety
    ///
    /// `frame.function` must be callable with the registers and stack image
    /// the frame holds, and `frame.stack` must address `stack_words` words.
    pub(crate) unsafe fn invoke(&self, frame: &mut NativeFrame) {
        unsafe { (self.entry)(frame) }
    }
}

struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

// The region is written once before it becomes executable, then only run.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    #[allow(dead_code)]
    fn from_code(code: &[u8]) -> Result<Self, String> {
        let len = code.len();
        if len == 0 {
            return Err("cannot create executable region for empty code".to_string());
        }
        let ptr = alloc_executable_region(len)?;
        let memory = Self { ptr, len };
        write_machine_code(ptr, code)?;
        finalize_executable_region(ptr, len)?;
        Ok(memory)
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        let _ = free_executable_region(self.ptr, self.len);
    }
}

#[cfg(any(
    all(target_arch = "x86_64", unix),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
))]
fn write_machine_code(ptr: *mut u8, code: &[u8]) -> Result<(), String> {
    ActiveBackend::write_machine_code(ptr, code)
}

#[cfg(not(any(
    all(target_arch = "x86_64", unix),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
)))]
fn write_machine_code(_ptr: *mut u8, _code: &[u8]) -> Result<(), String> {
    Err("unsupported platform for native code writes".to_string())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> Result<*mut u8, String> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(format!("mmap failed: {}", std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> Result<*mut u8, String> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(unix))]
fn alloc_executable_region(_len: usize) -> Result<*mut u8, String> {
    Err("executable memory allocation not implemented for this platform".to_string())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> Result<(), String> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> Result<(), String> {
    Ok(())
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> Result<(), String> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(format!("munmap failed: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> Result<(), String> {
    Ok(())
}

#[cfg(all(test, any(
    all(target_arch = "x86_64", unix),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
)))]
mod tests {
    use super::*;

    extern "C" fn sum9(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64, h: u64, i: u64) -> u64 {
        a + b * 2 + c * 3 + d * 4 + e * 5 + f * 6 + g * 7 + h * 8 + i * 9
    }

    extern "C" fn scale(x: f64, y: f64) -> f64 {
        x * y
    }

    #[test]
    fn integer_registers_and_stack_overflow() {
        let trampoline = Trampoline::prepare().expect("trampoline");
        let mut frame = NativeFrame::new(sum9 as usize);
        let stack = [1u64, 1, 1, 0];
        let registers = if cfg!(target_arch = "x86_64") { 6 } else { 8 };
        for index in 0..registers {
            frame.gpr[index] = 1;
        }
        frame.stack = stack.as_ptr();
        frame.stack_words = if registers == 6 { 4 } else { 2 };
        unsafe { trampoline.invoke(&mut frame) };
        assert_eq!(frame.gpr[0], 45);
    }

    #[test]
    fn float_registers_round_trip() {
        let trampoline = Trampoline::prepare().expect("trampoline");
        let mut frame = NativeFrame::new(scale as usize);
        frame.fpr[0] = 1.5f64.to_bits();
        frame.fpr[1] = 4.0f64.to_bits();
        unsafe { trampoline.invoke(&mut frame) };
        assert_eq!(f64::from_bits(frame.fpr[0]), 6.0);
    }
}
