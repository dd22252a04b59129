use log::{debug, error};

use crate::cpu::{CpuState, Eflags};
use crate::host::Host;
use crate::page_math::page_start;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExceptionCode {
    /// alignment check raised by an unaligned access
    AccessMisaligned,
    /// access to a protected page
    AccessDenied,
    /// any other fault, identified by the host's raw code
    Other(i32),
}

/// Exception as reported by the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExceptionInfo {
    pub code: ExceptionCode,
    /// faulting data address, if the host knows it
    pub fault_addr: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExceptHandling {
    /// fixed up; resume at the faulting instruction
    Handled,
    /// deliver to the monitored program as usual
    Unhandled,
    /// the monitored program has been terminated
    Terminated,
}

/// Internal exception handler protecting the tag storage.
#[derive(Copy, Clone, Debug, Default)]
pub struct FaultGuard {
    guard_page: Option<usize>,
}

impl FaultGuard {
    pub fn new(guard_page: Option<usize>) -> FaultGuard {
        FaultGuard { guard_page }
    }

    pub fn guard_page(&self) -> Option<usize> {
        self.guard_page
    }

    fn hits_guard(&self, addr: usize) -> bool {
        self.guard_page == Some(page_start(addr))
    }

    pub fn handle(
        &self,
        info: &ExceptionInfo,
        cpu: &mut dyn CpuState,
        host: &mut dyn Host,
    ) -> ExceptHandling {
        match info.code {
            ExceptionCode::AccessMisaligned => {
                // EFLAGS.AC gets asserted under analysis code; drop it and retry
                let flags = cpu.flags();
                debug!("clearing EFLAGS.AC (eflags={:#x})", flags);
                cpu.set_flags(flags & !Eflags::AC.bits());
                ExceptHandling::Handled
            }
            ExceptionCode::AccessDenied => match info.fault_addr {
                Some(addr) if self.hits_guard(addr) => {
                    error!(
                        "invalid access at {:#x} -- memory protection triggered",
                        addr
                    );
                    host.exit_application(-1);
                    ExceptHandling::Terminated
                }
                _ => ExceptHandling::Unhandled,
            },
            ExceptionCode::Other(_) => ExceptHandling::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_math::page_size;
    use crate::testing::{FakeCpu, MockHost};

    const GUARD: usize = 0x7000_0000;

    #[test]
    fn misaligned_access_clears_ac() {
        let guard = FaultGuard::new(Some(GUARD));
        let mut cpu = FakeCpu::default();
        cpu.eflags = (Eflags::AC | Eflags::ZF | Eflags::IF).bits();
        let mut host = MockHost::default();
        let info = ExceptionInfo {
            code: ExceptionCode::AccessMisaligned,
            fault_addr: Some(0x1001),
        };
        assert_eq!(
            guard.handle(&info, &mut cpu, &mut host),
            ExceptHandling::Handled
        );
        assert_eq!(cpu.eflags, (Eflags::ZF | Eflags::IF).bits());
        assert_eq!(host.exit_status, None);
    }

    #[test]
    fn guard_page_access_terminates() {
        let guard = FaultGuard::new(Some(GUARD));
        let mut cpu = FakeCpu::default();
        let mut host = MockHost::default();
        let info = ExceptionInfo {
            code: ExceptionCode::AccessDenied,
            fault_addr: Some(GUARD + 0x18),
        };
        assert_eq!(
            guard.handle(&info, &mut cpu, &mut host),
            ExceptHandling::Terminated
        );
        assert_eq!(host.exit_status, Some(-1));
    }

    #[test]
    fn other_faults_are_passed_on() {
        let guard = FaultGuard::new(Some(GUARD));
        let mut cpu = FakeCpu::default();
        cpu.eflags = Eflags::AC.bits();
        let mut host = MockHost::default();
        let cases = [
            ExceptionInfo {
                code: ExceptionCode::AccessDenied,
                fault_addr: Some(GUARD + page_size()),
            },
            ExceptionInfo {
                code: ExceptionCode::AccessDenied,
                fault_addr: None,
            },
            ExceptionInfo {
                code: ExceptionCode::Other(libc::SIGFPE),
                fault_addr: Some(GUARD),
            },
        ];
        for info in cases.iter() {
            assert_eq!(
                guard.handle(info, &mut cpu, &mut host),
                ExceptHandling::Unhandled
            );
        }
        assert_eq!(cpu.eflags, Eflags::AC.bits());
        assert_eq!(host.exit_status, None);

        let unguarded = FaultGuard::default();
        let info = ExceptionInfo {
            code: ExceptionCode::AccessDenied,
            fault_addr: Some(GUARD),
        };
        assert_eq!(
            unguarded.handle(&info, &mut cpu, &mut host),
            ExceptHandling::Unhandled
        );
    }
}
