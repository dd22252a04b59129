//! Runs the engine against real processes by stopping them at every syscall with ptrace.
//!
//! Traces are registered with the host but never delivered: ptrace does not compile code, so
//! the instruction dispatcher only runs when an embedder feeds it traces itself.

use log::{debug, info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{setoptions, traceme, Event, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use simple_error::{bail, try_with};
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;

use crate::cpu::{get_ip, CpuState, Regs, SyscallStandard};
use crate::engine::Engine;
use crate::fault_guard::{ExceptionCode, ExceptionInfo};
use crate::host::{Hook, Host};
use crate::ins::InsAnalysis;
use crate::result::Result;
use crate::tagmap::TagMap;

pub mod proc;
pub mod ptrace;
pub mod ptrace_syscall_info;

use self::ptrace::{attach_all_threads, Thread};
use self::ptrace_syscall_info::SyscallOp;

/// `si_code` values of SIGSEGV and SIGBUS, `<asm-generic/siginfo.h>`
const SEGV_MAPERR: i32 = 1;
const SEGV_ACCERR: i32 = 2;
const BUS_ADRALN: i32 = 1;

pub fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEEXEC
}

/// The `Host` side of a ptrace session.
#[derive(Debug)]
pub struct PtraceHost {
    pid: Pid,
    registered: Vec<Hook>,
    detach_requested: bool,
    exit_status: Option<i32>,
}

impl PtraceHost {
    pub fn new(pid: Pid) -> PtraceHost {
        PtraceHost {
            pid,
            registered: vec![],
            detach_requested: false,
            exit_status: None,
        }
    }

    pub fn registered(&self) -> &[Hook] {
        &self.registered
    }

    pub fn detach_requested(&self) -> bool {
        self.detach_requested
    }

    /// status requested through `exit_application`
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

impl Host for PtraceHost {
    fn register(&mut self, hook: Hook) -> Result<()> {
        if self.registered.contains(&hook) {
            bail!("{} callback registered twice", hook);
        }
        debug!("registered {} callback", hook);
        self.registered.push(hook);
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.detach_requested = true;
        Ok(())
    }

    fn exit_application(&mut self, status: i32) {
        self.exit_status = Some(status);
        if let Err(e) = signal::kill(self.pid, Signal::SIGKILL) {
            warn!("cannot kill {}: {}", self.pid, e);
        }
    }
}

/// Registers of a stopped thread; written back only when a hook changed them.
pub struct ThreadRegs {
    pub regs: Regs,
    pub dirty: bool,
}

impl ThreadRegs {
    pub fn new(regs: Regs) -> ThreadRegs {
        ThreadRegs { regs, dirty: false }
    }
}

impl CpuState for ThreadRegs {
    fn syscall_number(&self, std: SyscallStandard) -> u64 {
        self.regs.syscall_number(std)
    }

    fn syscall_arg(&self, std: SyscallStandard, idx: usize) -> u64 {
        self.regs.syscall_arg(std, idx)
    }

    fn syscall_return(&self, std: SyscallStandard) -> i64 {
        self.regs.syscall_return(std)
    }

    fn flags(&self) -> u64 {
        self.regs.flags()
    }

    fn set_flags(&mut self, flags: u64) {
        self.regs.set_flags(flags);
        self.dirty = true;
    }
}

fn exception_info(sig: Signal, info: &libc::siginfo_t) -> ExceptionInfo {
    let code = match (sig, info.si_code) {
        (Signal::SIGBUS, BUS_ADRALN) => ExceptionCode::AccessMisaligned,
        (Signal::SIGSEGV, SEGV_ACCERR) => ExceptionCode::AccessDenied,
        _ => ExceptionCode::Other(sig as i32),
    };
    let addr = unsafe { info.si_addr() } as usize;
    ExceptionInfo {
        code,
        fault_addr: if addr == 0 { None } else { Some(addr) },
    }
}

/// Traced threads of one process.
pub struct Tracer {
    pid: Pid,
    threads: HashMap<Pid, Thread>,
    exit_code: Option<i32>,
}

impl Tracer {
    /// Seizes all threads of the running process `pid`.
    pub fn attach(pid: Pid) -> Result<Tracer> {
        let threads = try_with!(
            attach_all_threads(pid, trace_options()),
            "cannot attach to process {}",
            pid
        );
        info!("attached to {} threads of {}", threads.len(), pid);
        Ok(Tracer {
            pid,
            threads: threads.into_iter().map(|t| (t.tid, t)).collect(),
            exit_code: None,
        })
    }

    /// Starts `command` stopped under ptrace.
    pub fn spawn(command: &[String]) -> Result<Tracer> {
        if command.is_empty() {
            bail!("no command given");
        }
        let args = try_with!(
            command
                .iter()
                .map(|a| CString::new(a.as_bytes()))
                .collect::<std::result::Result<Vec<_>, _>>(),
            "command contains a nul byte"
        );
        let mut argv = args.iter().map(|a| a.as_ptr()).collect::<Vec<_>>();
        argv.push(ptr::null());

        let pid = match try_with!(unsafe { fork() }, "fork failed") {
            ForkResult::Child => {
                // only async-signal-safe calls until exec
                let _ = traceme();
                let _ = signal::raise(Signal::SIGSTOP);
                unsafe {
                    libc::execvp(argv[0], argv.as_ptr());
                    libc::_exit(127)
                }
            }
            ForkResult::Parent { child } => child,
        };
        let tracer = Self::stopped_child(pid)?;
        info!("spawned {} as {}", command[0], pid);
        Ok(tracer)
    }

    /// Takes over a child that called `PTRACE_TRACEME` and stopped itself.
    fn stopped_child(pid: Pid) -> Result<Tracer> {
        match try_with!(waitpid(pid, None), "waitpid on {} failed", pid) {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => bail!("child {} did not stop itself: {:?}", pid, status),
        }
        try_with!(
            setoptions(pid, trace_options() | Options::PTRACE_O_EXITKILL),
            "cannot set ptrace options on {}",
            pid
        );
        let mut threads = HashMap::new();
        threads.insert(pid, Thread::new(pid));
        Ok(Tracer {
            pid,
            threads,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Forwards ptrace stops to `engine` until every thread exited or got released.
    /// Returns the exit code of the process, if it exited while traced.
    pub fn run<T, A>(mut self, engine: &mut Engine<PtraceHost, T, A>) -> Result<Option<i32>>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        let mut initial = self.threads.keys().copied().collect::<Vec<_>>();
        initial.sort_by_key(|tid| tid.as_raw());
        for tid in initial {
            engine.on_thread_start(tid);
            self.resume(tid, None, engine)?;
        }

        while !self.threads.is_empty() {
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => bail!("waitpid failed: {}", e),
            };
            self.handle(status, engine)?;
        }

        Ok(engine.host().exit_status().or(self.exit_code))
    }

    fn handle<T, A>(
        &mut self,
        status: WaitStatus,
        engine: &mut Engine<PtraceHost, T, A>,
    ) -> Result<()>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        match status {
            WaitStatus::PtraceSyscall(tid) => self.on_syscall(tid, engine),
            WaitStatus::PtraceEvent(tid, _, event) => self.on_event(tid, event, engine),
            WaitStatus::Stopped(tid, sig) => self.on_signal(tid, sig, engine),
            WaitStatus::Exited(tid, code) => {
                self.on_exit(tid, code, engine);
                Ok(())
            }
            WaitStatus::Signaled(tid, sig, _) => {
                self.on_exit(tid, 128 + sig as i32, engine);
                Ok(())
            }
            status => {
                trace!("ignoring {:?}", status);
                Ok(())
            }
        }
    }

    /// Starts tracking a thread we did not know about yet.
    fn adopt<T, A>(&mut self, tid: Pid, engine: &mut Engine<PtraceHost, T, A>) -> &mut Thread
    where
        T: TagMap,
        A: InsAnalysis,
    {
        if !self.threads.contains_key(&tid) {
            debug!("new thread {}", tid);
            engine.on_thread_start(tid);
        }
        self.threads.entry(tid).or_insert_with(|| Thread::new(tid))
    }

    fn on_syscall<T, A>(&mut self, tid: Pid, engine: &mut Engine<PtraceHost, T, A>) -> Result<()>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        let thread = self.adopt(tid, engine);
        let entry = match thread.syscall_info() {
            Ok(info) if info.op != SyscallOp::None => info.op.is_entry(),
            Ok(_) | Err(_) => !thread.in_syscall,
        };
        thread.in_syscall = entry;

        let mut cpu = ThreadRegs::new(thread.getregs()?);
        if entry {
            engine.on_syscall_entry(tid, &mut cpu);
        } else {
            engine.on_syscall_exit(tid, &mut cpu);
        }
        if cpu.dirty {
            thread.setregs(cpu.regs)?;
        }
        self.resume(tid, None, engine)
    }

    fn on_event<T, A>(
        &mut self,
        tid: Pid,
        event: i32,
        engine: &mut Engine<PtraceHost, T, A>,
    ) -> Result<()>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        let thread = self.adopt(tid, engine);
        if event == Event::PTRACE_EVENT_CLONE as i32 {
            let child = Pid::from_raw(thread.getevent()? as libc::pid_t);
            if !self.threads.contains_key(&child) {
                engine.on_thread_start(child);
                let mut t = Thread::new(child);
                t.fresh = true;
                self.threads.insert(child, t);
            }
            trace!("{} cloned {}", tid, child);
        } else if event == Event::PTRACE_EVENT_EXEC as i32 {
            let former = Pid::from_raw(thread.getevent()? as libc::pid_t);
            // a non-leader thread that calls exec takes over the leader's tid
            if former != tid {
                if let Some(mut t) = self.threads.remove(&former) {
                    t.mark_exited();
                }
                engine.on_thread_fini(former, 0);
            }
            debug!("{} executed a new program", tid);
        } else if event == Event::PTRACE_EVENT_STOP as i32 {
            thread.fresh = false;
        }
        self.resume(tid, None, engine)
    }

    fn on_signal<T, A>(
        &mut self,
        tid: Pid,
        sig: Signal,
        engine: &mut Engine<PtraceHost, T, A>,
    ) -> Result<()>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        let known = self.threads.contains_key(&tid);
        let thread = self.adopt(tid, engine);

        if sig == Signal::SIGSTOP && (thread.fresh || !known) {
            // initial stop of a new thread
            thread.fresh = false;
            return self.resume(tid, None, engine);
        }
        if sig != Signal::SIGSEGV && sig != Signal::SIGBUS {
            return self.resume(tid, Some(sig), engine);
        }

        // no engine code runs inside the tracee: the fault is the program's own
        if let (Ok(si), Ok(regs)) = (thread.siginfo(), thread.getregs()) {
            let info = exception_info(sig, &si);
            let ip = get_ip(&regs);
            debug!("thread {}: {:?} at ip {:#x}", tid, info.code, ip);
            if let Some(addr) = info.fault_addr {
                log_fault(self.pid, ip, addr);
            }
        }
        self.resume(tid, Some(sig), engine)
    }

    fn on_exit<T, A>(&mut self, tid: Pid, code: i32, engine: &mut Engine<PtraceHost, T, A>)
    where
        T: TagMap,
        A: InsAnalysis,
    {
        if let Some(mut thread) = self.threads.remove(&tid) {
            thread.mark_exited();
            engine.on_thread_fini(tid, code);
        }
        if tid == self.pid {
            info!("process {} exited with {}", tid, code);
            self.exit_code = Some(code);
        }
    }

    /// Resumes a stopped thread, or releases it once the engine asked to detach.
    fn resume<T, A>(
        &mut self,
        tid: Pid,
        sig: Option<Signal>,
        engine: &Engine<PtraceHost, T, A>,
    ) -> Result<()>
    where
        T: TagMap,
        A: InsAnalysis,
    {
        if engine.host().detach_requested() {
            if let Some(thread) = self.threads.remove(&tid) {
                debug!("releasing thread {}", tid);
                thread.detach(sig)?;
            }
            return Ok(());
        }
        match self.threads.get(&tid) {
            Some(thread) => thread.syscall(sig),
            None => bail!("cannot resume unknown thread {}", tid),
        }
    }
}

fn log_fault(pid: Pid, ip: u64, addr: usize) {
    match proc::maps(pid) {
        Ok(maps) => match proc::find_mapping(&maps, addr) {
            Some(m) => debug!(
                "ip {:#x}: fault at {:#x} in {:#x}-{:#x} {:?} {}",
                ip, addr, m.start, m.end, m.prot_flags, m.pathname
            ),
            None => debug!("ip {:#x}: fault at {:#x} outside of any mapping", ip, addr),
        },
        Err(e) => debug!("ip {:#x}: fault at {:#x}: {}", ip, addr, e),
    }
}
