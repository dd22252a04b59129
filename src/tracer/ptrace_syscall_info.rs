use nix::unistd::Pid;
use simple_error::bail;
use std::mem::{size_of, MaybeUninit};

use crate::result::Result;

const PTRACE_GET_SYSCALL_INFO: libc::c_uint = 0x420e;

const PTRACE_SYSCALL_INFO_NONE: u8 = 0;
const PTRACE_SYSCALL_INFO_ENTRY: u8 = 1;
const PTRACE_SYSCALL_INFO_EXIT: u8 = 2;
const PTRACE_SYSCALL_INFO_SECCOMP: u8 = 3;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct RawEntry {
    nr: u64,
    args: [u64; 6],
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct RawExit {
    rval: i64,
    is_error: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct RawSeccomp {
    nr: u64,
    args: [u64; 6],
    ret_data: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
union RawData {
    entry: RawEntry,
    exit: RawExit,
    seccomp: RawSeccomp,
}

/// `struct ptrace_syscall_info`
#[repr(C)]
#[derive(Copy, Clone)]
struct RawInfo {
    op: u8,
    arch: u32,
    instruction_pointer: u64,
    stack_pointer: u64,
    data: RawData,
}

/// Why a tracee is in a syscall-stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallOp {
    Entry { nr: u64, args: [u64; 6] },
    Exit { rval: i64, is_error: bool },
    Seccomp { nr: u64, ret_data: u32 },
    /// not in a syscall-stop
    None,
}

impl SyscallOp {
    pub fn is_entry(&self) -> bool {
        matches!(self, SyscallOp::Entry { .. } | SyscallOp::Seccomp { .. })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SyscallInfo {
    pub arch: u32,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub op: SyscallOp,
}

fn parse_raw(raw: &RawInfo, written: usize) -> Result<SyscallInfo> {
    let header = size_of::<RawInfo>() - size_of::<RawData>();
    // the kernel leaves out the union when there is nothing to report
    let op = match raw.op {
        PTRACE_SYSCALL_INFO_NONE if written >= header => SyscallOp::None,
        _ if written < size_of::<RawInfo>() => {
            bail!("ptrace wrote {} bytes of syscall info, expected {}", written, size_of::<RawInfo>())
        }
        // the kernel filled the variant named by `op`
        PTRACE_SYSCALL_INFO_ENTRY => unsafe {
            SyscallOp::Entry {
                nr: raw.data.entry.nr,
                args: raw.data.entry.args,
            }
        },
        PTRACE_SYSCALL_INFO_EXIT => unsafe {
            SyscallOp::Exit {
                rval: raw.data.exit.rval,
                is_error: raw.data.exit.is_error != 0,
            }
        },
        PTRACE_SYSCALL_INFO_SECCOMP => unsafe {
            SyscallOp::Seccomp {
                nr: raw.data.seccomp.nr,
                ret_data: raw.data.seccomp.ret_data,
            }
        },
        op => bail!("unknown ptrace_syscall_info.op: {}", op),
    };
    Ok(SyscallInfo {
        arch: raw.arch,
        instruction_pointer: raw.instruction_pointer,
        stack_pointer: raw.stack_pointer,
        op,
    })
}

pub fn get_syscall_info(pid: Pid) -> Result<SyscallInfo> {
    let mut info = MaybeUninit::<RawInfo>::zeroed();
    // the kernel writes at most size_of::<RawInfo>() bytes into the zeroed buffer
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO,
            pid.as_raw(),
            size_of::<RawInfo>(),
            info.as_mut_ptr(),
        )
    };
    if ret <= 0 {
        bail!("ptrace get syscall info error: {}", ret);
    }
    let info = unsafe { info.assume_init() };
    parse_raw(&info, ret as usize)
}
