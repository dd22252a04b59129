use log::{debug, error, warn};
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::collections::HashMap;

use crate::regs::GRP_NUM;
use crate::result::Result;
use crate::syscall::SyscallCtx;

/// Thread identity as reported by the host.
pub type Tid = Pid;

/// Tag type of a whole register; one bit per byte.
pub type RegTag = u32;

/// Shadow register file: one slot per canonical register plus one scratch slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VcpuCtx {
    gpr: [RegTag; GRP_NUM + 1],
}

impl VcpuCtx {
    /// Indices handed out for unmapped registers all end up in the scratch slot.
    fn slot(indx: usize) -> usize {
        indx.min(GRP_NUM)
    }

    pub fn get(&self, indx: usize) -> RegTag {
        self.gpr[Self::slot(indx)]
    }

    pub fn set(&mut self, indx: usize, tag: RegTag) {
        self.gpr[Self::slot(indx)] = tag;
    }

    pub fn clear(&mut self) {
        self.gpr = [0; GRP_NUM + 1];
    }
}

/// Shadow state owned by exactly one monitored thread.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadCtx {
    pub syscall_ctx: SyscallCtx,
    pub vcpu: VcpuCtx,
}

/// Owns the `ThreadCtx` of every live thread.
#[derive(Debug, Default)]
pub struct ThreadContexts {
    threads: HashMap<Tid, Box<ThreadCtx>>,
}

impl ThreadContexts {
    /// Reserves room for `expected` threads up front.
    pub fn new(expected: usize) -> Result<ThreadContexts> {
        let mut threads = HashMap::new();
        try_with!(
            threads.try_reserve(expected),
            "cannot reserve thread context storage for {} threads",
            expected
        );
        Ok(ThreadContexts { threads })
    }

    /// Creates the context of a starting thread. A stale context of the same tid is reset.
    pub fn thread_alloc(&mut self, tid: Tid) -> Result<()> {
        if let Some(ctx) = self.threads.get_mut(&tid) {
            warn!("thread {} started twice, resetting its context", tid);
            **ctx = ThreadCtx::default();
            return Ok(());
        }
        if let Err(e) = self.threads.try_reserve(1) {
            error!("thread_alloc: thread context allocation failed ({})", e);
            bail!("cannot allocate context for thread {}: {}", tid, e);
        }
        self.threads.insert(tid, Box::new(ThreadCtx::default()));
        debug!("thread {} started ({} live)", tid, self.threads.len());
        Ok(())
    }

    /// Releases the context of a terminated thread.
    pub fn thread_free(&mut self, tid: Tid) -> Option<Box<ThreadCtx>> {
        let ctx = self.threads.remove(&tid);
        if ctx.is_none() {
            warn!("thread {} stopped without a context", tid);
        } else {
            debug!("thread {} stopped ({} live)", tid, self.threads.len());
        }
        ctx
    }

    pub fn get(&self, tid: Tid) -> Option<&ThreadCtx> {
        self.threads.get(&tid).map(|ctx| &**ctx)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadCtx> {
        self.threads.get_mut(&tid).map(|ctx| &mut **ctx)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
