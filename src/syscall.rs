//! Syscall interception: argument capture on entry, callbacks and default tag clearing on exit.

use log::{trace, warn};
use simple_error::bail;
use std::fmt;

use crate::cpu::{CpuState, SyscallStandard};
use crate::result::Result;
use crate::tagmap::TagMap;

/// Size of the descriptor table; numbers at or above are treated as unknown.
pub const SYSCALL_MAX: usize = 512;

/// Maximum number of syscall arguments.
pub const SYSCALL_ARG_NUM: usize = 6;

/// Pre- or post-syscall callback. The processor state is only borrowed for the call.
pub type SyscallHook =
    Box<dyn Fn(&mut SyscallCtx, &mut dyn CpuState, &mut dyn TagMap) + Send + Sync>;

/// Per-thread record of the syscall currently in flight. Reused for every syscall.
#[derive(Clone, Debug, PartialEq)]
pub struct SyscallCtx {
    /// `-1` if the syscall is unknown; no other field is meaningful then.
    pub nr: i64,
    /// Only the first `nargs` entries of the syscall's descriptor are valid.
    pub arg: [u64; SYSCALL_ARG_NUM],
    pub ret: i64,
}

impl Default for SyscallCtx {
    fn default() -> Self {
        SyscallCtx {
            nr: -1,
            arg: [0; SYSCALL_ARG_NUM],
            ret: 0,
        }
    }
}

#[derive(Default)]
pub struct SyscallDesc {
    /// number of significant arguments
    pub nargs: usize,
    /// capture arguments even without a callback registered
    pub save_args: bool,
    /// the syscall returns data through its arguments
    pub retval_args: bool,
    /// bytes written by the kernel through argument `i`; 0 if it is not an output buffer
    pub map_args: [usize; SYSCALL_ARG_NUM],
    pub pre: Option<SyscallHook>,
    pub post: Option<SyscallHook>,
}

impl SyscallDesc {
    fn captures(&self) -> bool {
        self.save_args | self.retval_args
    }
}

impl fmt::Debug for SyscallDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SyscallDesc")
            .field("nargs", &self.nargs)
            .field("save_args", &self.save_args)
            .field("retval_args", &self.retval_args)
            .field("map_args", &self.map_args)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

/// Descriptors indexed by syscall number.
pub struct SyscallTable {
    desc: Vec<SyscallDesc>,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    pub fn new() -> SyscallTable {
        SyscallTable {
            desc: (0..SYSCALL_MAX).map(|_| SyscallDesc::default()).collect(),
        }
    }

    pub fn get(&self, nr: usize) -> Option<&SyscallDesc> {
        self.desc.get(nr)
    }

    fn get_mut(&mut self, nr: usize) -> Result<&mut SyscallDesc> {
        match self.desc.get_mut(nr) {
            Some(desc) => Ok(desc),
            None => bail!("syscall number {} is out of range", nr),
        }
    }

    /// Replaces the descriptor of `nr` wholesale.
    pub fn set_desc(&mut self, nr: usize, desc: SyscallDesc) -> Result<()> {
        if desc.nargs > SYSCALL_ARG_NUM {
            bail!(
                "syscall {} declares {} arguments, at most {} are supported",
                nr,
                desc.nargs,
                SYSCALL_ARG_NUM
            );
        }
        *self.get_mut(nr)? = desc;
        Ok(())
    }

    /// Installs a pre-syscall callback; arguments are captured from now on.
    pub fn set_pre(&mut self, nr: usize, pre: Option<SyscallHook>) -> Result<()> {
        let pre = match pre {
            Some(pre) => pre,
            None => bail!("no pre-syscall callback given for syscall {}", nr),
        };
        let desc = self.get_mut(nr)?;
        desc.pre = Some(pre);
        desc.save_args = true;
        Ok(())
    }

    /// Installs a post-syscall callback; it replaces the default tag clearing.
    pub fn set_post(&mut self, nr: usize, post: Option<SyscallHook>) -> Result<()> {
        let post = match post {
            Some(post) => post,
            None => bail!("no post-syscall callback given for syscall {}", nr),
        };
        let desc = self.get_mut(nr)?;
        desc.post = Some(post);
        desc.save_args = true;
        Ok(())
    }

    pub fn clr_pre(&mut self, nr: usize) -> Result<()> {
        let desc = self.get_mut(nr)?;
        desc.pre = None;
        if desc.post.is_none() {
            desc.save_args = false;
        }
        Ok(())
    }

    pub fn clr_post(&mut self, nr: usize) -> Result<()> {
        let desc = self.get_mut(nr)?;
        desc.post = None;
        if desc.pre.is_none() {
            desc.save_args = false;
        }
        Ok(())
    }

    /// Syscall entry: records the number, captures the declared arguments and runs the
    /// pre-callback.
    pub fn sysenter_save(
        &self,
        ctx: &mut SyscallCtx,
        cpu: &mut dyn CpuState,
        std: SyscallStandard,
        tagmap: &mut dyn TagMap,
    ) {
        let nr = cpu.syscall_number(std);
        let desc = match self.desc.get(nr as usize) {
            Some(desc) if nr < SYSCALL_MAX as u64 => desc,
            _ => {
                warn!("sysenter_save: unknown syscall (num={})", nr as i64);
                // hint for sysexit_save
                ctx.nr = -1;
                return;
            }
        };
        ctx.nr = nr as i64;

        if !desc.captures() {
            return;
        }
        let nargs = desc.nargs.min(SYSCALL_ARG_NUM);
        for (i, arg) in ctx.arg.iter_mut().enumerate().take(nargs) {
            *arg = cpu.syscall_arg(std, i);
        }
        trace!("syscall {} enter, args {:x?}", nr, &ctx.arg[..nargs]);

        if let Some(pre) = &desc.pre {
            pre(ctx, cpu, tagmap);
        }
    }

    /// Syscall exit: records the return value and runs the post-callback, or clears the tags
    /// of every output buffer the kernel has written to.
    pub fn sysexit_save(
        &self,
        ctx: &mut SyscallCtx,
        cpu: &mut dyn CpuState,
        std: SyscallStandard,
        tagmap: &mut dyn TagMap,
    ) {
        if ctx.nr < 0 {
            warn!("sysexit_save: unknown syscall (num={})", ctx.nr);
            return;
        }
        let desc = match self.desc.get(ctx.nr as usize) {
            Some(desc) => desc,
            None => return,
        };
        if !desc.captures() {
            return;
        }
        ctx.ret = cpu.syscall_return(std);
        trace!("syscall {} exit, ret {}", ctx.nr, ctx.ret);

        match &desc.post {
            Some(post) => post(ctx, cpu, tagmap),
            None => default_post(desc, ctx, tagmap),
        }
    }
}

fn default_post(desc: &SyscallDesc, ctx: &SyscallCtx, tagmap: &mut dyn TagMap) {
    // failed; nothing was written
    if ctx.ret < 0 {
        return;
    }
    let nargs = desc.nargs.min(SYSCALL_ARG_NUM);
    for (len, addr) in desc.map_args.iter().zip(ctx.arg.iter()).take(nargs) {
        if *len > 0 && *addr != 0 {
            tagmap.clrn(*addr as usize, *len);
        }
    }
}
