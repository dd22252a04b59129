use nix::unistd::{sysconf, SysconfVar};

const FALLBACK_PAGE_SIZE: usize = 4096;

pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Start of the page containing `v`.
pub fn page_start(v: usize) -> usize {
    v & !(page_size() - 1)
}
