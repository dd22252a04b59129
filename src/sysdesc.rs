//! Descriptors of common Linux x86_64 syscalls that write to user memory.

use libc::{
    SYS_clock_gettime, SYS_fstat, SYS_getcwd, SYS_getrandom, SYS_gettimeofday, SYS_lstat,
    SYS_newfstatat, SYS_pipe, SYS_pipe2, SYS_pread64, SYS_read, SYS_recvfrom, SYS_stat, SYS_uname,
};
use log::debug;
use std::sync::Arc;

use crate::cpu::CpuState;
use crate::result::Result;
use crate::syscall::{SyscallCtx, SyscallDesc, SyscallHook, SyscallTable};
use crate::tagmap::TagMap;

/// `struct stat`
const STAT_SIZE: usize = 144;
/// `struct utsname`
const UTSNAME_SIZE: usize = 6 * 65;

/// (number, argument count, bytes written through each argument)
const FIXED_OUTPUT: &[(usize, usize, [usize; 6])] = &[
    (SYS_stat as usize, 2, [0, STAT_SIZE, 0, 0, 0, 0]),
    (SYS_fstat as usize, 2, [0, STAT_SIZE, 0, 0, 0, 0]),
    (SYS_lstat as usize, 2, [0, STAT_SIZE, 0, 0, 0, 0]),
    (SYS_newfstatat as usize, 4, [0, 0, STAT_SIZE, 0, 0, 0]),
    (SYS_pipe as usize, 1, [8, 0, 0, 0, 0, 0]),
    (SYS_pipe2 as usize, 2, [8, 0, 0, 0, 0, 0]),
    (SYS_gettimeofday as usize, 2, [16, 8, 0, 0, 0, 0]),
    (SYS_uname as usize, 1, [UTSNAME_SIZE, 0, 0, 0, 0, 0]),
    (SYS_clock_gettime as usize, 2, [0, 16, 0, 0, 0, 0]),
];

/// (number, argument count) of syscalls reading from the descriptor in argument 0 into the
/// buffer in argument 1; the return value is the byte count.
const FD_INPUT: &[(usize, usize)] = &[
    (SYS_read as usize, 3),
    (SYS_pread64 as usize, 4),
    (SYS_recvfrom as usize, 6),
];

/// (number, argument count) of syscalls filling the buffer in argument 0 with as many bytes as
/// they return.
const RET_SIZED: &[(usize, usize)] = &[(SYS_getrandom as usize, 3), (SYS_getcwd as usize, 2)];

fn fd_input_hook(sources: Arc<Vec<u64>>) -> SyscallHook {
    Box::new(
        move |ctx: &mut SyscallCtx, _cpu: &mut dyn CpuState, tagmap: &mut dyn TagMap| {
            if ctx.ret <= 0 {
                return;
            }
            let (addr, len) = (ctx.arg[1] as usize, ctx.ret as usize);
            if sources.contains(&ctx.arg[0]) {
                tagmap.setn(addr, len);
            } else {
                tagmap.clrn(addr, len);
            }
        },
    )
}

fn ret_sized_hook() -> SyscallHook {
    Box::new(
        |ctx: &mut SyscallCtx, _cpu: &mut dyn CpuState, tagmap: &mut dyn TagMap| {
            if ctx.ret > 0 && ctx.arg[0] != 0 {
                tagmap.clrn(ctx.arg[0] as usize, ctx.ret as usize);
            }
        },
    )
}

/// Fills `table`; data read from any descriptor in `taint_fds` gets tainted.
pub fn install(table: &mut SyscallTable, taint_fds: &[u32]) -> Result<()> {
    for (nr, nargs, map_args) in FIXED_OUTPUT {
        let desc = SyscallDesc {
            nargs: *nargs,
            retval_args: true,
            map_args: *map_args,
            ..Default::default()
        };
        table.set_desc(*nr, desc)?;
    }

    let sources = Arc::new(taint_fds.iter().map(|fd| u64::from(*fd)).collect::<Vec<_>>());
    for (nr, nargs) in FD_INPUT {
        let desc = SyscallDesc {
            nargs: *nargs,
            retval_args: true,
            ..Default::default()
        };
        table.set_desc(*nr, desc)?;
        table.set_post(*nr, Some(fd_input_hook(Arc::clone(&sources))))?;
    }
    for (nr, nargs) in RET_SIZED {
        let desc = SyscallDesc {
            nargs: *nargs,
            retval_args: true,
            ..Default::default()
        };
        table.set_desc(*nr, desc)?;
        table.set_post(*nr, Some(ret_sized_hook()))?;
    }

    debug!(
        "installed {} syscall descriptors, taint sources {:?}",
        FIXED_OUTPUT.len() + FD_INPUT.len() + RET_SIZED.len(),
        taint_fds
    );
    Ok(())
}
