use log::debug;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use simple_error::{bail, try_with};
use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::page_math::{page_size, page_start};
use crate::result::Result;

/// Shadow memory: one taint bit per byte of the monitored address space.
pub trait TagMap {
    /// Sets up the backing storage, including the guard page.
    fn alloc(&mut self) -> Result<()>;

    /// Marks `len` bytes starting at `addr` as untainted. A zero `len` is a no-op.
    fn clrn(&mut self, addr: usize, len: usize);

    /// Marks `len` bytes starting at `addr` as tainted.
    fn setn(&mut self, addr: usize, len: usize);

    fn is_tainted(&self, addr: usize) -> bool;

    /// Start address of the protected page surrounding the storage, once allocated.
    fn guard_page(&self) -> Option<usize>;
}

const WORD_BITS: usize = 64;

/// Tag storage that only materializes pages which have been tainted at least once.
pub struct SparseTagMap {
    pages: HashMap<usize, Vec<u64>>,
    guard: Option<usize>,
}

impl Default for SparseTagMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseTagMap {
    pub fn new() -> SparseTagMap {
        SparseTagMap {
            pages: HashMap::new(),
            guard: None,
        }
    }

    /// Number of pages currently holding tags.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn tainted_bytes(&self) -> usize {
        self.pages
            .values()
            .flat_map(|bits| bits.iter())
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    fn for_each_byte<F>(&mut self, addr: usize, len: usize, mut f: F)
    where
        F: FnMut(&mut Vec<u64>, usize),
    {
        let ps = page_size();
        let words = ps / WORD_BITS;
        let mut cur = addr;
        let end = addr.saturating_add(len);
        while cur < end {
            let page = page_start(cur);
            let chunk_end = end.min(page.saturating_add(ps));
            let bits = self.pages.entry(page).or_insert_with(|| vec![0; words]);
            for byte in cur..chunk_end {
                f(bits, byte - page);
            }
            cur = chunk_end;
        }
    }
}

impl TagMap for SparseTagMap {
    fn alloc(&mut self) -> Result<()> {
        if self.guard.is_some() {
            return Ok(());
        }
        let len = match NonZeroUsize::new(page_size()) {
            Some(len) => len,
            None => bail!("page size is zero"),
        };
        // Nothing is ever mapped here; any access traps and identifies corrupted bookkeeping.
        let addr = try_with!(
            unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_NONE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            },
            "cannot map tagmap guard page"
        );
        debug!("tagmap guard page at {:#x}", addr as usize);
        self.guard = Some(addr as usize);
        Ok(())
    }

    fn clrn(&mut self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        let ps = page_size();
        let mut cur = addr;
        let end = addr.saturating_add(len);
        // pages never tainted stay unmaterialized
        while cur < end {
            let page = page_start(cur);
            let chunk_end = end.min(page.saturating_add(ps));
            if let Some(bits) = self.pages.get_mut(&page) {
                for byte in cur..chunk_end {
                    let off = byte - page;
                    bits[off / WORD_BITS] &= !(1 << (off % WORD_BITS));
                }
                if bits.iter().all(|w| *w == 0) {
                    self.pages.remove(&page);
                }
            }
            cur = chunk_end;
        }
    }

    fn setn(&mut self, addr: usize, len: usize) {
        self.for_each_byte(addr, len, |bits, off| {
            bits[off / WORD_BITS] |= 1 << (off % WORD_BITS);
        });
    }

    fn is_tainted(&self, addr: usize) -> bool {
        let page = page_start(addr);
        let off = addr - page;
        self.pages
            .get(&page)
            .map(|bits| bits[off / WORD_BITS] & (1 << (off % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    fn guard_page(&self) -> Option<usize> {
        self.guard
    }
}

impl Drop for SparseTagMap {
    fn drop(&mut self) {
        if let Some(addr) = self.guard.take() {
            if let Err(e) = unsafe { munmap(addr as *mut libc::c_void, page_size()) } {
                log::warn!("cannot unmap tagmap guard page: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_across_pages() {
        let ps = page_size();
        let mut tm = SparseTagMap::new();
        let base = 10 * ps - 2;
        tm.setn(base, 4);
        assert!(tm.is_tainted(base));
        assert!(tm.is_tainted(base + 3));
        assert!(!tm.is_tainted(base + 4));
        assert!(!tm.is_tainted(base - 1));
        assert_eq!(tm.resident_pages(), 2);
        assert_eq!(tm.tainted_bytes(), 4);

        tm.clrn(base + 1, 2);
        assert_eq!(tm.tainted_bytes(), 2);
        assert!(tm.is_tainted(base));
        assert!(!tm.is_tainted(base + 1));
        assert!(!tm.is_tainted(base + 2));
        assert!(tm.is_tainted(base + 3));

        tm.clrn(base, 4);
        assert_eq!(tm.resident_pages(), 0);
        assert_eq!(tm.tainted_bytes(), 0);
    }

    #[test]
    fn zero_length_clear_is_noop() {
        let mut tm = SparseTagMap::new();
        tm.setn(0x1000, 1);
        tm.clrn(0x1000, 0);
        assert!(tm.is_tainted(0x1000));
    }

    #[test]
    fn guard_page_is_allocated_once() {
        let mut tm = SparseTagMap::new();
        assert_eq!(tm.guard_page(), None);
        tm.alloc().expect("alloc");
        let guard = tm.guard_page().expect("guard page");
        assert_eq!(page_start(guard), guard);
        tm.alloc().expect("second alloc");
        assert_eq!(tm.guard_page(), Some(guard));
    }
}
