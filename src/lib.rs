#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod cpu;
pub mod engine;
pub mod fault_guard;
pub mod host;
pub mod ins;
pub mod page_math;
pub mod regs;
pub mod result;
pub mod syscall;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod sysdesc;
pub mod tagmap;
pub mod thread_ctx;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod trace;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod tracer;

#[cfg(test)]
mod testing;
