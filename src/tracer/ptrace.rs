use libc::c_void;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options, Request, RequestType};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use simple_error::try_with;
use std::ptr;

use crate::cpu::Regs;
use crate::result::Result;
use crate::tracer::proc;
use crate::tracer::ptrace_syscall_info::{get_syscall_info, SyscallInfo};

/// A traced thread. Detaches when dropped unless it already exited.
#[derive(Debug)]
pub struct Thread {
    pub tid: Pid,
    /// between a syscall-entry and its syscall-exit stop
    pub in_syscall: bool,
    /// announced by a clone event, initial stop not seen yet
    pub fresh: bool,
    attached: bool,
}

/// `ptrace(PTRACE_INTERRUPT, ...)`; only valid for seized tracees
fn interrupt(tid: Pid) -> nix::Result<()> {
    let res = unsafe {
        libc::ptrace(
            Request::PTRACE_INTERRUPT as RequestType,
            tid.as_raw(),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    Errno::result(res).map(drop)
}

impl Thread {
    /// Wraps a thread that is already traced by us.
    pub fn new(tid: Pid) -> Thread {
        Thread {
            tid,
            in_syscall: false,
            fresh: false,
            attached: true,
        }
    }

    pub fn getregs(&self) -> Result<Regs> {
        Ok(try_with!(
            ptrace::getregs(self.tid),
            "cannot get registers of {} with ptrace",
            self.tid
        ))
    }

    pub fn setregs(&self, regs: Regs) -> Result<()> {
        try_with!(
            ptrace::setregs(self.tid, regs),
            "cannot set registers of {} with ptrace",
            self.tid
        );
        Ok(())
    }

    pub fn interrupt(&self) -> Result<()> {
        try_with!(interrupt(self.tid), "cannot interrupt tracee {}", self.tid);
        Ok(())
    }

    /// Resumes until the next syscall-stop, delivering `sig`.
    pub fn syscall(&self, sig: Option<Signal>) -> Result<()> {
        try_with!(
            ptrace::syscall(self.tid, sig),
            "cannot resume {} to next syscall with ptrace",
            self.tid
        );
        Ok(())
    }

    pub fn syscall_info(&self) -> Result<SyscallInfo> {
        Ok(try_with!(
            get_syscall_info(self.tid),
            "cannot get syscall info of {}",
            self.tid
        ))
    }

    pub fn getevent(&self) -> Result<i64> {
        Ok(try_with!(
            ptrace::getevent(self.tid),
            "cannot get ptrace event message of {}",
            self.tid
        ))
    }

    pub fn siginfo(&self) -> Result<libc::siginfo_t> {
        Ok(try_with!(
            ptrace::getsiginfo(self.tid),
            "cannot get siginfo of {} with ptrace",
            self.tid
        ))
    }

    /// The kernel dropped the thread; there is nothing left to detach from.
    pub fn mark_exited(&mut self) {
        self.attached = false;
    }

    /// Lets the stopped thread run natively, delivering `sig`.
    pub fn detach(mut self, sig: Option<Signal>) -> Result<()> {
        self.attached = false;
        try_with!(
            ptrace::detach(self.tid, sig),
            "cannot detach from {}",
            self.tid
        );
        Ok(())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if let Err(e) = ptrace::detach(self.tid, None) {
            log::warn!("cannot ptrace::detach from {}: {}", self.tid, e);
        }
    }
}

/// Seizes `tid` and waits until it is stopped.
pub fn attach_seize(tid: Pid, options: Options) -> Result<Thread> {
    try_with!(ptrace::seize(tid, options), "cannot seize thread {}", tid);
    let thread = Thread::new(tid);
    thread.interrupt()?;
    try_with!(
        waitpid(tid, Some(WaitPidFlag::__WALL)),
        "waitpid on {} failed",
        tid
    );
    Ok(thread)
}

/// Seizes every thread of `pid`; all of them are stopped on return.
pub fn attach_all_threads(pid: Pid, options: Options) -> Result<Vec<Thread>> {
    proc::threads(pid)?
        .into_iter()
        .map(|tid| attach_seize(tid, options))
        .collect()
}
