use bitflags::bitflags;

bitflags! {
    /// The subset of EFLAGS the engine inspects or modifies.
    pub struct Eflags: u64 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        /// alignment check
        const AC = 1 << 18;
    }
}

/// How arguments and return values of a syscall are laid out in the processor state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallStandard {
    /// `int 0x80`: ebx, ecx, edx, esi, edi, ebp
    LinuxIa32,
    /// `syscall`: rdi, rsi, rdx, r10, r8, r9
    LinuxIntel64,
}

/// Architectural state of a stopped thread as handed to us by the host.
///
/// Implementations only have to be valid for the duration of the callback they are passed to.
pub trait CpuState {
    fn syscall_number(&self, std: SyscallStandard) -> u64;

    /// `idx` must be below 6.
    fn syscall_arg(&self, std: SyscallStandard, idx: usize) -> u64;

    fn syscall_return(&self, std: SyscallStandard) -> i64;

    fn flags(&self) -> u64;

    fn set_flags(&mut self, flags: u64);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use self::x86_64::Regs;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod x86_64 {
    use super::{CpuState, SyscallStandard};

    pub type Regs = libc::user_regs_struct;

    impl CpuState for Regs {
        fn syscall_number(&self, _std: SyscallStandard) -> u64 {
            // rax is already clobbered with -ENOSYS at the entry stop
            self.orig_rax
        }

        fn syscall_arg(&self, std: SyscallStandard, idx: usize) -> u64 {
            match std {
                SyscallStandard::LinuxIntel64 => match idx {
                    0 => self.rdi,
                    1 => self.rsi,
                    2 => self.rdx,
                    3 => self.r10,
                    4 => self.r8,
                    _ => self.r9,
                },
                SyscallStandard::LinuxIa32 => {
                    let v = match idx {
                        0 => self.rbx,
                        1 => self.rcx,
                        2 => self.rdx,
                        3 => self.rsi,
                        4 => self.rdi,
                        _ => self.rbp,
                    };
                    v & 0xffff_ffff
                }
            }
        }

        fn syscall_return(&self, std: SyscallStandard) -> i64 {
            match std {
                SyscallStandard::LinuxIntel64 => self.rax as i64,
                SyscallStandard::LinuxIa32 => self.rax as u32 as i32 as i64,
            }
        }

        fn flags(&self) -> u64 {
            self.eflags
        }

        fn set_flags(&mut self, flags: u64) {
            self.eflags = flags;
        }
    }

    pub fn get_ip(regs: &Regs) -> u64 {
        regs.rip
    }

}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use self::x86_64::get_ip;
