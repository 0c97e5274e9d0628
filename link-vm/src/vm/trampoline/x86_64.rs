use super::NativeBackend;

pub(super) struct X86_64Backend;

impl NativeBackend for X86_64Backend {
    fn machine_code() -> Vec<u8> {
        let mut code = Vec::with_capacity(160);
        code.extend_from_slice(&[
            0x55, // push rbp
            0x48, 0x89, 0xE5, // mov rbp, rsp
            0x53, // push rbx
            0x41, 0x54, // push r12 (keeps rsp 16 byte aligned)
            0x48, 0x89, 0xFB, // mov rbx, rdi
            0x48, 0x8B, 0x4B, 0x10, // mov rcx, [rbx+16]
            0x48, 0xC1, 0xE1, 0x03, // shl rcx, 3
            0x48, 0x29, 0xCC, // sub rsp, rcx
            0x48, 0x8B, 0x73, 0x08, // mov rsi, [rbx+8]
            0x48, 0x89, 0xE7, // mov rdi, rsp
            0x48, 0xC1, 0xE9, 0x03, // shr rcx, 3
            0xFC, // cld
            0xF3, 0x48, 0xA5, // rep movsq
            0x48, 0x8D, 0x43, 0x18, // lea rax, [rbx+24]
        ]);
        // movsd xmmN, [rax+64+8N]
        for index in 0..8u8 {
            code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x40 | (index << 3), 0x40 + index * 8]);
        }
        code.extend_from_slice(&[
            0x48, 0x8B, 0x78, 0x00, // mov rdi, [rax]
            0x48, 0x8B, 0x70, 0x08, // mov rsi, [rax+8]
            0x48, 0x8B, 0x50, 0x10, // mov rdx, [rax+16]
            0x48, 0x8B, 0x48, 0x18, // mov rcx, [rax+24]
            0x4C, 0x8B, 0x40, 0x20, // mov r8, [rax+32]
            0x4C, 0x8B, 0x48, 0x28, // mov r9, [rax+40]
            0x4C, 0x8B, 0x1B, // mov r11, [rbx]
            0x41, 0xFF, 0xD3, // call r11
            0x48, 0x89, 0x43, 0x18, // mov [rbx+24], rax
            0x48, 0x89, 0x53, 0x20, // mov [rbx+32], rdx
            0xF2, 0x0F, 0x11, 0x43, 0x58, // movsd [rbx+88], xmm0
            0xF2, 0x0F, 0x11, 0x4B, 0x60, // movsd [rbx+96], xmm1
            0x48, 0x8D, 0x65, 0xF0, // lea rsp, [rbp-16]
            0x41, 0x5C, // pop r12
            0x5B, // pop rbx
            0x5D, // pop rbp
            0xC3, // ret
        ]);
        code
    }

    fn write_machine_code(ptr: *mut u8, code: &[u8]) -> Result<(), String> {
        #[cfg(target_os = "macos")]
        unsafe {
            let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
            if use_write_protect {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if use_write_protect {
                pthread_jit_write_protect_np(1);
            }
        }

        #[cfg(not(target_os = "macos"))]
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        Ok(())
    }
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_offsets_match_the_encoding() {
        use super::super::NativeFrame;
        use std::mem::offset_of;
        assert_eq!(offset_of!(NativeFrame, stack), 8);
        assert_eq!(offset_of!(NativeFrame, stack_words), 16);
        assert_eq!(offset_of!(NativeFrame, gpr), 24);
        assert_eq!(offset_of!(NativeFrame, fpr), 88);
    }

    #[test]
    fn code_ends_in_ret() {
        let code = X86_64Backend::machine_code();
        assert_eq!(code.last(), Some(&0xC3));
    }
}
