use log::info;
use nix::unistd::Pid;
use simple_error::try_with;

use crate::cpu::SyscallStandard;
use crate::engine::{Engine, EngineOptions};
use crate::ins::Ins;
use crate::result::Result;
use crate::sysdesc;
use crate::tagmap::SparseTagMap;
use crate::tracer::{PtraceHost, Tracer};

#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// seize all threads of a running process
    Pid(Pid),
    /// spawn a program and trace it from its first instruction
    Command(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct TraceOptions {
    pub target: Target,
    pub expected_threads: usize,
    /// data read from these file descriptors gets tainted
    pub taint_fds: Vec<u32>,
}

/// Runs the target under the tagging engine until it exits or the engine detaches.
/// Returns the target's exit code when it exited while traced.
pub fn trace(opts: &TraceOptions) -> Result<Option<i32>> {
    let tracer = match &opts.target {
        Target::Pid(pid) => Tracer::attach(*pid)?,
        Target::Command(command) => Tracer::spawn(command)?,
    };

    let engine_opts = EngineOptions {
        std: SyscallStandard::LinuxIntel64,
        expected_threads: opts.expected_threads,
    };
    // instruction level propagation is supplied by embedders; the CLI tracks syscall data only
    let analysis = |_: &Ins| {};
    let mut engine = try_with!(
        Engine::init(
            PtraceHost::new(tracer.pid()),
            SparseTagMap::new(),
            analysis,
            &engine_opts
        ),
        "cannot initialize tagging engine"
    );

    try_with!(
        sysdesc::install(engine.syscall_table_mut(), &opts.taint_fds),
        "cannot install syscall descriptors"
    );

    let status = tracer.run(&mut engine)?;
    let tagmap = engine.tagmap();
    info!(
        "done, {} bytes tainted in {} pages{}",
        tagmap.tainted_bytes(),
        tagmap.resident_pages(),
        if engine.is_detached() { ", detached" } else { "" }
    );
    Ok(status)
}
