use log::{error, info, trace, warn};
use simple_error::try_with;

use crate::cpu::{CpuState, SyscallStandard};
use crate::fault_guard::{ExceptHandling, ExceptionInfo, FaultGuard};
use crate::host::{Hook, Host};
use crate::ins::{InsAnalysis, InsTable, Trace};
use crate::result::Result;
use crate::syscall::SyscallTable;
use crate::tagmap::TagMap;
use crate::thread_ctx::{ThreadContexts, ThreadCtx, Tid};

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// calling convention of the monitored program's syscalls
    pub std: SyscallStandard,
    /// thread contexts to reserve up front
    pub expected_threads: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            std: SyscallStandard::LinuxIntel64,
            expected_threads: 16,
        }
    }
}

/// The tagging engine: thread contexts, descriptor tables and the fault guard wired into a
/// host.
pub struct Engine<H, T, A> {
    host: H,
    tagmap: T,
    analysis: A,
    threads: ThreadContexts,
    syscalls: SyscallTable,
    ins: InsTable,
    guard: FaultGuard,
    std: SyscallStandard,
    detached: bool,
}

fn register(host: &mut dyn Host, hook: Hook) -> Result<()> {
    try_with!(host.register(hook), "cannot register {} callback", hook);
    Ok(())
}

impl<H, T, A> Engine<H, T, A>
where
    H: Host,
    T: TagMap,
    A: InsAnalysis,
{
    /// Wires the engine into `host`. Must succeed before the monitored program runs
    /// instrumented; on error nothing should be executed under the engine.
    pub fn init(mut host: H, mut tagmap: T, analysis: A, opts: &EngineOptions) -> Result<Self> {
        let threads = try_with!(
            ThreadContexts::new(opts.expected_threads),
            "thread context initialization failed"
        );
        register(&mut host, Hook::ThreadStart)?;
        register(&mut host, Hook::ThreadFini)?;

        try_with!(tagmap.alloc(), "tagmap initialization failed");

        register(&mut host, Hook::SyscallEntry)?;
        register(&mut host, Hook::SyscallExit)?;

        let mut ins = InsTable::new();
        ins.reset();
        register(&mut host, Hook::Trace)?;

        let guard = FaultGuard::new(tagmap.guard_page());
        register(&mut host, Hook::InternalException)?;

        info!("tagging engine initialized");
        Ok(Engine {
            host,
            tagmap,
            analysis,
            threads,
            syscalls: SyscallTable::new(),
            ins,
            guard,
            std: opts.std,
            detached: false,
        })
    }

    /// Stops instrumentation for good; the monitored program continues natively.
    pub fn die(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        warn!("detaching from the monitored program");
        if let Err(e) = self.host.detach() {
            error!("cannot detach: {}", e);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn on_thread_start(&mut self, tid: Tid) {
        if self.detached {
            return;
        }
        if let Err(e) = self.threads.thread_alloc(tid) {
            // every later hook of this thread needs its context
            error!("{}", e);
            self.die();
        }
    }

    pub fn on_thread_fini(&mut self, tid: Tid, code: i32) {
        if self.detached {
            return;
        }
        trace!("thread {} exits with {}", tid, code);
        self.threads.thread_free(tid);
    }

    pub fn on_syscall_entry(&mut self, tid: Tid, cpu: &mut dyn CpuState) {
        if self.detached {
            return;
        }
        let ctx = match self.threads.get_mut(tid) {
            Some(ctx) => ctx,
            None => {
                warn!("syscall entry on untracked thread {}", tid);
                return;
            }
        };
        self.syscalls
            .sysenter_save(&mut ctx.syscall_ctx, cpu, self.std, &mut self.tagmap);
    }

    pub fn on_syscall_exit(&mut self, tid: Tid, cpu: &mut dyn CpuState) {
        if self.detached {
            return;
        }
        let ctx = match self.threads.get_mut(tid) {
            Some(ctx) => ctx,
            None => {
                warn!("syscall exit on untracked thread {}", tid);
                return;
            }
        };
        self.syscalls
            .sysexit_save(&mut ctx.syscall_ctx, cpu, self.std, &mut self.tagmap);
    }

    pub fn on_trace(&mut self, trace: &Trace) {
        if self.detached {
            return;
        }
        self.ins.trace_inspect(trace, &mut self.analysis);
    }

    pub fn on_exception(
        &mut self,
        tid: Tid,
        info: &ExceptionInfo,
        cpu: &mut dyn CpuState,
    ) -> ExceptHandling {
        if self.detached {
            return ExceptHandling::Unhandled;
        }
        let verdict = self.guard.handle(info, cpu, &mut self.host);
        trace!("thread {}: {:?} -> {:?}", tid, info, verdict);
        verdict
    }

    /// Descriptors must be set up before the monitored program runs.
    pub fn syscall_table_mut(&mut self) -> &mut SyscallTable {
        &mut self.syscalls
    }

    pub fn ins_table(&self) -> &InsTable {
        &self.ins
    }

    /// Descriptors must be set up before the monitored program runs.
    pub fn ins_table_mut(&mut self) -> &mut InsTable {
        &mut self.ins
    }

    pub fn thread_ctx(&self, tid: Tid) -> Option<&ThreadCtx> {
        self.threads.get(tid)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn tagmap(&self) -> &T {
        &self.tagmap
    }

    pub fn fault_guard(&self) -> &FaultGuard {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_guard::ExceptionCode;
    use crate::ins::{Bbl, Ins, InsHook, INSDFL_DISABLE};
    use crate::syscall::SyscallDesc;
    use crate::testing::{FakeCpu, MockHost, RecordingTagMap};
    use nix::unistd::Pid;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingAnalysis {
        seen: Arc<AtomicUsize>,
    }

    impl InsAnalysis for CountingAnalysis {
        fn ins_inspect(&mut self, _ins: &Ins) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestEngine = Engine<MockHost, RecordingTagMap, CountingAnalysis>;

    fn engine() -> TestEngine {
        Engine::init(
            MockHost::default(),
            RecordingTagMap::default(),
            CountingAnalysis::default(),
            &EngineOptions::default(),
        )
        .expect("init")
    }

    fn tid(raw: i32) -> Tid {
        Pid::from_raw(raw)
    }

    #[test]
    fn init_registers_hooks_in_order() {
        let e = engine();
        assert_eq!(
            e.host().registered,
            vec![
                Hook::ThreadStart,
                Hook::ThreadFini,
                Hook::SyscallEntry,
                Hook::SyscallExit,
                Hook::Trace,
                Hook::InternalException,
            ]
        );
        assert_eq!(e.fault_guard().guard_page(), Some(0x7000_0000));
        assert!(!e.is_detached());
    }

    #[test]
    fn init_fails_when_any_step_fails() {
        let tagmap = RecordingTagMap {
            fail_alloc: true,
            ..Default::default()
        };
        let res = Engine::init(
            MockHost::default(),
            tagmap,
            CountingAnalysis::default(),
            &EngineOptions::default(),
        );
        assert!(res.is_err());

        for hook in [Hook::ThreadStart, Hook::SyscallExit, Hook::InternalException].iter() {
            let host = MockHost {
                fail_on: Some(*hook),
                ..Default::default()
            };
            let res = Engine::init(
                host,
                RecordingTagMap::default(),
                CountingAnalysis::default(),
                &EngineOptions::default(),
            );
            assert!(res.is_err(), "{:?}", hook);
        }
    }

    #[test]
    fn thread_lifecycle() {
        let mut e = engine();
        e.on_thread_start(tid(1));
        e.on_thread_start(tid(2));
        assert_eq!(e.thread_count(), 2);
        e.on_thread_fini(tid(1), 0);
        assert!(e.thread_ctx(tid(1)).is_none());
        assert!(e.thread_ctx(tid(2)).is_some());
        e.on_thread_fini(tid(2), 0);
        assert_eq!(e.thread_count(), 0);
    }

    #[test]
    fn syscall_round_trip_per_thread() {
        let mut e = engine();
        let desc = SyscallDesc {
            nargs: 3,
            retval_args: true,
            map_args: [0, 16, 0, 0, 0, 0],
            ..Default::default()
        };
        e.syscall_table_mut().set_desc(0, desc).expect("set_desc");
        e.on_thread_start(tid(1));
        e.on_thread_start(tid(2));

        let mut cpu1 = FakeCpu::syscall(0, [3, 0x5000, 16, 0, 0, 0], 16);
        let mut cpu2 = FakeCpu::syscall(0, [4, 0x6000, 16, 0, 0, 0], -11);
        e.on_syscall_entry(tid(1), &mut cpu1);
        e.on_syscall_entry(tid(2), &mut cpu2);
        assert_eq!(
            e.thread_ctx(tid(1)).map(|c| c.syscall_ctx.arg[1]),
            Some(0x5000)
        );
        assert_eq!(
            e.thread_ctx(tid(2)).map(|c| c.syscall_ctx.arg[1]),
            Some(0x6000)
        );
        e.on_syscall_exit(tid(2), &mut cpu2);
        e.on_syscall_exit(tid(1), &mut cpu1);
        assert_eq!(e.tagmap().cleared, vec![(0x5000, 16)]);

        // untracked thread: nothing happens
        let mut cpu3 = FakeCpu::syscall(0, [5, 0x7000, 16, 0, 0, 0], 16);
        e.on_syscall_entry(tid(3), &mut cpu3);
        e.on_syscall_exit(tid(3), &mut cpu3);
        assert_eq!(cpu3.arg_reads.get(), 0);
        assert_eq!(e.tagmap().cleared.len(), 1);
    }

    #[test]
    fn instruction_hooks_end_to_end() {
        const ICLASS: usize = 42;
        let pre = Arc::new(AtomicUsize::new(0));
        let post = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let analysis = CountingAnalysis {
            seen: Arc::clone(&seen),
        };
        let mut e = Engine::init(
            MockHost::default(),
            RecordingTagMap::default(),
            analysis,
            &EngineOptions::default(),
        )
        .expect("init");
        let pre_hits = Arc::clone(&pre);
        let pre_hook: InsHook = Box::new(move |_: &Ins| {
            pre_hits.fetch_add(1, Ordering::SeqCst);
        });
        let post_hits = Arc::clone(&post);
        let post_hook: InsHook = Box::new(move |_: &Ins| {
            post_hits.fetch_add(1, Ordering::SeqCst);
        });
        let table = e.ins_table_mut();
        table.set_dflact(ICLASS, INSDFL_DISABLE).expect("set_dflact");
        table.set_pre(ICLASS, Some(pre_hook)).expect("set_pre");
        table.set_post(ICLASS, Some(post_hook)).expect("set_post");

        let ins: Vec<Ins> = (0..3)
            .map(|i| Ins {
                addr: 0x400000 + i,
                size: 1,
                iclass: ICLASS,
            })
            .collect();
        e.on_trace(&Trace {
            bbls: vec![Bbl { ins }],
        });

        assert_eq!(pre.load(Ordering::SeqCst), 3);
        assert_eq!(post.load(Ordering::SeqCst), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guard_violation_terminates_program() {
        let mut e = engine();
        let mut cpu = FakeCpu::default();
        let info = ExceptionInfo {
            code: ExceptionCode::AccessDenied,
            fault_addr: Some(0x7000_0010),
        };
        assert_eq!(
            e.on_exception(tid(1), &info, &mut cpu),
            ExceptHandling::Terminated
        );
        assert_eq!(e.host().exit_status, Some(-1));
    }

    #[test]
    fn die_is_one_way() {
        let mut e = engine();
        e.on_thread_start(tid(1));
        e.die();
        e.die();
        assert!(e.is_detached());
        assert_eq!(e.host().detach_calls, 1);

        e.on_thread_start(tid(2));
        assert!(e.thread_ctx(tid(2)).is_none());
        let mut cpu = FakeCpu::default();
        let info = ExceptionInfo {
            code: ExceptionCode::AccessMisaligned,
            fault_addr: None,
        };
        assert_eq!(
            e.on_exception(tid(1), &info, &mut cpu),
            ExceptHandling::Unhandled
        );
    }
}
