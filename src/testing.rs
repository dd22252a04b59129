//! Fakes of the host side used by the unit tests.

use simple_error::bail;
use std::cell::Cell;

use crate::cpu::{CpuState, SyscallStandard};
use crate::host::{Hook, Host};
use crate::result::Result;
use crate::tagmap::TagMap;

#[derive(Debug, Default)]
pub struct FakeCpu {
    pub nr: u64,
    pub args: [u64; 6],
    pub ret: i64,
    pub eflags: u64,
    pub arg_reads: Cell<usize>,
}

impl FakeCpu {
    pub fn syscall(nr: u64, args: [u64; 6], ret: i64) -> FakeCpu {
        FakeCpu {
            nr,
            args,
            ret,
            ..Default::default()
        }
    }
}

impl CpuState for FakeCpu {
    fn syscall_number(&self, _std: SyscallStandard) -> u64 {
        self.nr
    }

    fn syscall_arg(&self, _std: SyscallStandard, idx: usize) -> u64 {
        self.arg_reads.set(self.arg_reads.get() + 1);
        self.args[idx]
    }

    fn syscall_return(&self, _std: SyscallStandard) -> i64 {
        self.ret
    }

    fn flags(&self) -> u64 {
        self.eflags
    }

    fn set_flags(&mut self, flags: u64) {
        self.eflags = flags;
    }
}

/// Remembers every range it was asked to clear or set.
#[derive(Debug, Default)]
pub struct RecordingTagMap {
    pub cleared: Vec<(usize, usize)>,
    pub tainted: Vec<(usize, usize)>,
    pub guard: Option<usize>,
    pub fail_alloc: bool,
}

impl TagMap for RecordingTagMap {
    fn alloc(&mut self) -> Result<()> {
        if self.fail_alloc {
            bail!("out of shadow memory");
        }
        self.guard = Some(0x7000_0000);
        Ok(())
    }

    fn clrn(&mut self, addr: usize, len: usize) {
        if len > 0 {
            self.cleared.push((addr, len));
        }
    }

    fn setn(&mut self, addr: usize, len: usize) {
        self.tainted.push((addr, len));
    }

    fn is_tainted(&self, addr: usize) -> bool {
        self.tainted
            .iter()
            .any(|(start, len)| *start <= addr && addr < start + len)
    }

    fn guard_page(&self) -> Option<usize> {
        self.guard
    }
}

#[derive(Debug, Default)]
pub struct MockHost {
    pub registered: Vec<Hook>,
    /// registration of this hook fails
    pub fail_on: Option<Hook>,
    pub detach_calls: usize,
    pub exit_status: Option<i32>,
}

impl Host for MockHost {
    fn register(&mut self, hook: Hook) -> Result<()> {
        if self.fail_on == Some(hook) {
            bail!("host refused hook");
        }
        self.registered.push(hook);
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.detach_calls += 1;
        Ok(())
    }

    fn exit_application(&mut self, status: i32) {
        self.exit_status = Some(status);
    }
}
