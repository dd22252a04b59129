use std::fmt;

use crate::result::Result;

/// Callbacks the engine registers with the instrumentation host.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Hook {
    ThreadStart,
    ThreadFini,
    SyscallEntry,
    SyscallExit,
    /// per compiled trace
    Trace,
    InternalException,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Hook::ThreadStart => "thread start",
            Hook::ThreadFini => "thread fini",
            Hook::SyscallEntry => "syscall entry",
            Hook::SyscallExit => "syscall exit",
            Hook::Trace => "trace instrumentation",
            Hook::InternalException => "internal exception",
        };
        write!(f, "{}", name)
    }
}

/// The binary instrumentation host running the monitored program.
pub trait Host {
    /// Asks the host to deliver `hook` events to the engine.
    fn register(&mut self, hook: Hook) -> Result<()>;

    /// Ends instrumentation; the monitored program keeps running natively. Not reversible.
    fn detach(&mut self) -> Result<()>;

    /// Terminates the monitored program with `status`.
    fn exit_application(&mut self, status: i32);
}
