//! Register to shadow slot mapping.
//!
//! The shadow register file of every thread keeps one slot per canonical general purpose
//! register. Sub-registers (`ax`, `al`, `ah`, ...) share the slot of their 32-bit container.
//! Everything else is mapped to `GRP_NUM + <register id>`, which never collides with a
//! canonical slot; the shadow register file folds those indices into its scratch slot.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Number of canonical general purpose registers with a dedicated shadow slot.
pub const GRP_NUM: usize = 8;

/// Register identities as delivered by the host's decoder.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, FromPrimitive, ToPrimitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum Reg {
    Invalid = 0,

    Rdi,
    Rsi,
    Rbp,
    Rsp,
    Rbx,
    Rdx,
    Rcx,
    Rax,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,

    Edi,
    Esi,
    Ebp,
    Esp,
    Ebx,
    Edx,
    Ecx,
    Eax,

    Di,
    Si,
    Bp,
    Sp,
    Bx,
    Dx,
    Cx,
    Ax,

    Bl,
    Dl,
    Cl,
    Al,
    Bh,
    Dh,
    Ch,
    Ah,

    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,

    Eflags,
    Eip,
    Rip,

    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,

    Last,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegWidth {
    W8,
    W16,
    W32,
    W64,
    /// segment, flag, instruction pointer and vector registers
    Other,
}

impl Reg {
    pub fn from_raw(raw: u16) -> Option<Reg> {
        Reg::from_u16(raw).filter(|r| *r != Reg::Last)
    }

    pub fn width(self) -> RegWidth {
        use Reg::*;
        match self {
            Rdi | Rsi | Rbp | Rsp | Rbx | Rdx | Rcx | Rax | R8 | R9 | R10 | R11 | R12 | R13
            | R14 | R15 => RegWidth::W64,
            Edi | Esi | Ebp | Esp | Ebx | Edx | Ecx | Eax => RegWidth::W32,
            Di | Si | Bp | Sp | Bx | Dx | Cx | Ax => RegWidth::W16,
            Bl | Dl | Cl | Al | Bh | Dh | Ch | Ah => RegWidth::W8,
            _ => RegWidth::Other,
        }
    }
}

fn scratch(reg: Reg) -> usize {
    debug_assert!(reg != Reg::Last);
    GRP_NUM + reg as usize
}

/// Shadow slot of a 32-bit register.
pub fn reg32_indx(reg: Reg) -> usize {
    match reg {
        Reg::Edi => 0,
        Reg::Esi => 1,
        Reg::Ebp => 2,
        Reg::Esp => 3,
        Reg::Ebx => 4,
        Reg::Edx => 5,
        Reg::Ecx => 6,
        Reg::Eax => 7,
        _ => scratch(reg),
    }
}

/// Shadow slot of a 16-bit register, i.e. the slot of its 32-bit container.
pub fn reg16_indx(reg: Reg) -> usize {
    match reg {
        Reg::Di => 0,
        Reg::Si => 1,
        Reg::Bp => 2,
        Reg::Sp => 3,
        Reg::Bx => 4,
        Reg::Dx => 5,
        Reg::Cx => 6,
        Reg::Ax => 7,
        _ => scratch(reg),
    }
}

/// Shadow slot of an 8-bit register; high and low halves share their container's slot.
pub fn reg8_indx(reg: Reg) -> usize {
    match reg {
        Reg::Ah | Reg::Al => 7,
        Reg::Ch | Reg::Cl => 6,
        Reg::Dh | Reg::Dl => 5,
        Reg::Bh | Reg::Bl => 4,
        _ => scratch(reg),
    }
}

/// Picks the mapping matching the width of `reg`.
pub fn reg_indx(reg: Reg) -> usize {
    match reg.width() {
        RegWidth::W8 => reg8_indx(reg),
        RegWidth::W16 => reg16_indx(reg),
        RegWidth::W32 => reg32_indx(reg),
        RegWidth::W64 | RegWidth::Other => scratch(reg),
    }
}
