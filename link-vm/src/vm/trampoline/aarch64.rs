use super::NativeBackend;

pub(super) struct Aarch64Backend;

const FRAME: u32 = 19;
const SP: u32 = 31;
const GPR_OFFSET: u32 = 24;
const FPR_OFFSET: u32 = 88;

fn ldr_x(rt: u32, rn: u32, offset: u32) -> u32 {
    0xF940_0000 | ((offset / 8) << 10) | (rn << 5) | rt
}

fn str_x(rt: u32, rn: u32, offset: u32) -> u32 {
    0xF900_0000 | ((offset / 8) << 10) | (rn << 5) | rt
}

fn ldr_d(rt: u32, rn: u32, offset: u32) -> u32 {
    0xFD40_0000 | ((offset / 8) << 10) | (rn << 5) | rt
}

fn str_d(rt: u32, rn: u32, offset: u32) -> u32 {
    0xFD00_0000 | ((offset / 8) << 10) | (rn << 5) | rt
}

impl NativeBackend for Aarch64Backend {
    fn machine_code() -> Vec<u8> {
        let mut words = vec![
            0xA9BE_7BFD,          // stp x29, x30, [sp, #-32]!
            0x9100_03FD,          // mov x29, sp
            str_x(FRAME, SP, 16), // str x19, [sp, #16]
            0xAA00_03F3,          // mov x19, x0
            ldr_x(9, FRAME, 16),  // ldr x9, [x19, #16]
            ldr_x(10, FRAME, 8),  // ldr x10, [x19, #8]
            0xD37D_F12B,          // lsl x11, x9, #3
            0xCB2B_63FF,          // sub sp, sp, x11
            0x9100_03EC,          // mov x12, sp
            0xB400_00A9,          // cbz x9, +5
            0xF840_854D,          // ldr x13, [x10], #8
            0xF800_858D,          // str x13, [x12], #8
            0xD100_0529,          // sub x9, x9, #1
            0x17FF_FFFC,          // b -4
        ];
        for index in 0..8 {
            words.push(ldr_d(index, FRAME, FPR_OFFSET + index * 8));
        }
        for index in 0..8 {
            words.push(ldr_x(index, FRAME, GPR_OFFSET + index * 8));
        }
        words.extend([
            ldr_x(16, FRAME, 0), // ldr x16, [x19]
            0xD63F_0200,         // blr x16
            str_x(0, FRAME, GPR_OFFSET),
            str_x(1, FRAME, GPR_OFFSET + 8),
        ]);
        for index in 0..4 {
            words.push(str_d(index, FRAME, FPR_OFFSET + index * 8));
        }
        words.extend([
            0x9100_03BF,          // mov sp, x29
            ldr_x(FRAME, SP, 16), // ldr x19, [sp, #16]
            0xA8C2_7BFD,          // ldp x29, x30, [sp], #32
            0xD65F_03C0,          // ret
        ]);
        words.into_iter().flat_map(u32::to_le_bytes).collect()
    }

    fn write_machine_code(ptr: *mut u8, code: &[u8]) -> Result<(), String> {
        #[cfg(target_os = "macos")]
        unsafe {
            let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
            if use_write_protect {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            sys_icache_invalidate(ptr as *mut libc::c_void, code.len());
            if use_write_protect {
                pthread_jit_write_protect_np(1);
            }
        }

        #[cfg(target_os = "linux")]
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            __clear_cache(
                ptr as *mut libc::c_char,
                ptr.add(code.len()) as *mut libc::c_char,
            );
        }

        Ok(())
    }
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_use_scaled_offsets() {
        assert_eq!(ldr_x(16, FRAME, 0), 0xF940_0270);
        assert_eq!(ldr_x(FRAME, SP, 16), 0xF940_0BF3);
        assert_eq!(ldr_d(0, FRAME, FPR_OFFSET), 0xFD40_2E60);
    }

    #[test]
    fn copy_loop_branches_back_to_the_test() {
        let code = Aarch64Backend::machine_code();
        let words: Vec<u32> = code
            .chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let cbz = words.iter().position(|word| *word == 0xB400_00A9).expect("cbz");
        assert_eq!(words[cbz + 4], 0x17FF_FFFC);
        assert_eq!(words.last(), Some(&0xD65F_03C0));
    }
}
