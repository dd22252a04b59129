//! Per-instruction hook dispatch.
//!
//! Every time the host hands us a freshly compiled trace we walk its instructions and, per
//! opcode class, run the pre-callback, the default taint analysis (unless disabled) and the
//! post-callback, in that order.

use log::warn;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use simple_error::bail;
use std::fmt;

use crate::result::Result;

/// Number of opcode classes known to the decoder.
pub const ICLASS_LAST: usize = 1024;

pub const INSDFL_ENABLE: usize = 0;
pub const INSDFL_DISABLE: usize = 1;

/// Whether the default analysis runs for an opcode class.
#[repr(usize)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum DefaultAction {
    Enable = INSDFL_ENABLE,
    Disable = INSDFL_DISABLE,
}

impl Default for DefaultAction {
    fn default() -> Self {
        DefaultAction::Enable
    }
}

/// A decoded instruction of a compiled trace.
#[derive(Clone, Debug, PartialEq)]
pub struct Ins {
    pub addr: u64,
    pub size: usize,
    /// opcode class, indexes the descriptor table
    pub iclass: usize,
}

/// Straight-line run of instructions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bbl {
    pub ins: Vec<Ins>,
}

/// Unit of code the host compiles and offers once for instrumentation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    pub bbls: Vec<Bbl>,
}

impl Trace {
    pub fn ins(&self) -> impl Iterator<Item = &Ins> {
        self.bbls.iter().flat_map(|bbl| bbl.ins.iter())
    }
}

/// The generic taint propagation routine.
pub trait InsAnalysis {
    fn ins_inspect(&mut self, ins: &Ins);
}

impl<F> InsAnalysis for F
where
    F: FnMut(&Ins),
{
    fn ins_inspect(&mut self, ins: &Ins) {
        self(ins)
    }
}

pub type InsHook = Box<dyn Fn(&Ins) + Send + Sync>;

#[derive(Default)]
pub struct InsDesc {
    pub pre: Option<InsHook>,
    pub post: Option<InsHook>,
    pub dflact: DefaultAction,
}

impl fmt::Debug for InsDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InsDesc")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("dflact", &self.dflact)
            .finish()
    }
}

/// Instruction descriptors indexed by opcode class.
pub struct InsTable {
    desc: Vec<InsDesc>,
}

impl Default for InsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InsTable {
    pub fn new() -> InsTable {
        InsTable {
            desc: (0..ICLASS_LAST).map(|_| InsDesc::default()).collect(),
        }
    }

    pub fn get(&self, iclass: usize) -> Option<&InsDesc> {
        self.desc.get(iclass)
    }

    fn get_mut(&mut self, iclass: usize) -> Result<&mut InsDesc> {
        match self.desc.get_mut(iclass) {
            Some(desc) => Ok(desc),
            None => bail!("no instruction descriptor for opcode class {}", iclass),
        }
    }

    pub fn set_pre(&mut self, iclass: usize, pre: Option<InsHook>) -> Result<()> {
        let desc = self.get_mut(iclass)?;
        match pre {
            Some(pre) => desc.pre = Some(pre),
            None => bail!("no pre-ins callback given for opcode class {}", iclass),
        }
        Ok(())
    }

    pub fn set_post(&mut self, iclass: usize, post: Option<InsHook>) -> Result<()> {
        let desc = self.get_mut(iclass)?;
        match post {
            Some(post) => desc.post = Some(post),
            None => bail!("no post-ins callback given for opcode class {}", iclass),
        }
        Ok(())
    }

    pub fn clr_pre(&mut self, iclass: usize) -> Result<()> {
        self.get_mut(iclass)?.pre = None;
        Ok(())
    }

    pub fn clr_post(&mut self, iclass: usize) -> Result<()> {
        self.get_mut(iclass)?.post = None;
        Ok(())
    }

    /// `action` is one of `INSDFL_ENABLE` or `INSDFL_DISABLE`.
    pub fn set_dflact(&mut self, iclass: usize, action: usize) -> Result<()> {
        let desc = self.get_mut(iclass)?;
        match DefaultAction::from_usize(action) {
            Some(action) => desc.dflact = action,
            None => bail!("invalid default action {} for opcode class {}", action, iclass),
        }
        Ok(())
    }

    /// Resets every descriptor: no callbacks, default analysis enabled.
    pub fn reset(&mut self) {
        self.desc.iter_mut().for_each(|d| *d = InsDesc::default());
    }

    /// Instruments every instruction of `trace`.
    pub fn trace_inspect(&self, trace: &Trace, analysis: &mut dyn InsAnalysis) {
        for ins in trace.ins() {
            let desc = match self.desc.get(ins.iclass) {
                Some(desc) => desc,
                None => {
                    warn!(
                        "trace_inspect: unknown opcode class {} at {:#x}",
                        ins.iclass, ins.addr
                    );
                    analysis.ins_inspect(ins);
                    continue;
                }
            };
            if let Some(pre) = &desc.pre {
                pre(ins);
            }
            if desc.dflact == DefaultAction::Enable {
                analysis.ins_inspect(ins);
            }
            if let Some(post) = &desc.post {
                post(ins);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const MOV: usize = 7;
    const ADD: usize = 8;

    fn ins(iclass: usize, addr: u64) -> Ins {
        Ins {
            addr,
            size: 2,
            iclass,
        }
    }

    fn trace_of(classes: &[usize]) -> Trace {
        let ins = classes
            .iter()
            .enumerate()
            .map(|(i, c)| ins(*c, 0x1000 + 2 * i as u64))
            .collect();
        Trace {
            bbls: vec![Bbl { ins }],
        }
    }

    fn logging_hook(log: &Arc<Mutex<Vec<String>>>, what: &'static str) -> Option<InsHook> {
        let log = Arc::clone(log);
        let hook: InsHook = Box::new(move |ins: &Ins| {
            if let Ok(mut log) = log.lock() {
                log.push(format!("{}@{:x}", what, ins.addr));
            }
        });
        Some(hook)
    }

    #[test]
    fn disabled_default_with_both_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = InsTable::new();
        table.set_pre(MOV, logging_hook(&log, "pre")).expect("set_pre");
        table.set_post(MOV, logging_hook(&log, "post")).expect("set_post");
        table.set_dflact(MOV, INSDFL_DISABLE).expect("set_dflact");

        let mut analysed = 0;
        let mut analysis = |_: &Ins| analysed += 1;
        table.trace_inspect(&trace_of(&[MOV, MOV, MOV]), &mut analysis);

        assert_eq!(analysed, 0);
        let log = log.lock().expect("lock");
        assert_eq!(log.iter().filter(|l| l.starts_with("pre")).count(), 3);
        assert_eq!(log.iter().filter(|l| l.starts_with("post")).count(), 3);
    }

    #[test]
    fn order_is_pre_default_post() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = InsTable::new();
        table.set_pre(ADD, logging_hook(&log, "pre")).expect("set_pre");
        table.set_post(ADD, logging_hook(&log, "post")).expect("set_post");

        let analysis_log = Arc::clone(&log);
        let mut analysis = move |ins: &Ins| {
            if let Ok(mut log) = analysis_log.lock() {
                log.push(format!("dfl@{:x}", ins.addr));
            }
        };
        let trace = Trace {
            bbls: vec![
                Bbl {
                    ins: vec![ins(ADD, 0x10)],
                },
                Bbl {
                    ins: vec![ins(MOV, 0x20), ins(ADD, 0x30)],
                },
            ],
        };
        table.trace_inspect(&trace, &mut analysis);

        let log = log.lock().expect("lock");
        assert_eq!(
            *log,
            vec![
                "pre@10", "dfl@10", "post@10", "dfl@20", "pre@30", "dfl@30", "post@30"
            ]
        );
    }

    #[test]
    fn recompiled_traces_dispatch_again() {
        let table = InsTable::new();
        let mut analysed = 0;
        let trace = trace_of(&[MOV, ADD]);
        for _ in 0..3 {
            let mut analysis = |_: &Ins| analysed += 1;
            table.trace_inspect(&trace, &mut analysis);
        }
        assert_eq!(analysed, 6);
    }

    #[test]
    fn setters_reject_invalid_input() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = InsTable::new();
        assert!(table.set_pre(MOV, None).is_err());
        assert!(table.set_post(MOV, None).is_err());
        assert!(table.set_pre(ICLASS_LAST, logging_hook(&log, "pre")).is_err());
        assert!(table.set_post(ICLASS_LAST, logging_hook(&log, "post")).is_err());
        assert!(table.clr_pre(ICLASS_LAST).is_err());
        assert!(table.clr_post(ICLASS_LAST).is_err());
        assert!(table.set_dflact(ICLASS_LAST, INSDFL_DISABLE).is_err());
        assert!(table.set_dflact(MOV, 2).is_err());
        assert!(table.set_dflact(MOV, usize::MAX).is_err());

        let desc = table.get(MOV).expect("desc");
        assert!(desc.pre.is_none());
        assert!(desc.post.is_none());
        assert_eq!(desc.dflact, DefaultAction::Enable);
    }

    #[test]
    fn clear_and_reset() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = InsTable::new();
        table.set_pre(MOV, logging_hook(&log, "pre")).expect("set_pre");
        table.set_post(MOV, logging_hook(&log, "post")).expect("set_post");
        table.clr_pre(MOV).expect("clr_pre");
        assert!(table.get(MOV).map(|d| d.pre.is_none() && d.post.is_some()) == Some(true));
        table.set_dflact(MOV, INSDFL_DISABLE).expect("set_dflact");
        table.reset();
        let desc = table.get(MOV).expect("desc");
        assert!(desc.post.is_none());
        assert_eq!(desc.dflact, DefaultAction::Enable);
    }
}
