use nix::sys::mman::ProtFlags;
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::fs::{read_dir, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::result::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub prot_flags: ProtFlags,
    pub pathname: String,
}

impl Mapping {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

pub fn find_mapping(mappings: &[Mapping], addr: usize) -> Option<&Mapping> {
    mappings.iter().find(|m| m.contains(addr))
}

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

/// Thread ids listed in a `/proc/<pid>/task`-like directory.
pub fn read_tids(dir: &Path) -> Result<Vec<Pid>> {
    let entries = try_with!(read_dir(dir), "failed to open directory {}", dir.display());
    let mut tids = vec![];
    for entry in entries {
        let entry = try_with!(entry, "failed to read directory {}", dir.display());
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(name) => name,
            None => bail!("invalid tid {:?} in {}", file_name, dir.display()),
        };
        let raw = try_with!(name.parse::<libc::pid_t>(), "invalid tid {}", name);
        tids.push(Pid::from_raw(raw));
    }
    tids.sort_by_key(|tid| tid.as_raw());
    Ok(tids)
}

pub fn threads(pid: Pid) -> Result<Vec<Pid>> {
    read_tids(&pid_path(pid).join("task"))
}

fn parse_prot(fields: &[u8]) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if fields.first() == Some(&b'r') {
        prot |= ProtFlags::PROT_READ;
    }
    if fields.get(1) == Some(&b'w') {
        prot |= ProtFlags::PROT_WRITE;
    }
    if fields.get(2) == Some(&b'x') {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn parse_line(line: &str) -> Result<Mapping> {
    let fields = line.splitn(6, ' ').collect::<Vec<_>>();
    if fields.len() < 5 {
        bail!("too few fields");
    }
    let range = fields[0].splitn(2, '-').collect::<Vec<_>>();
    if range.len() != 2 {
        bail!("invalid address range: {}", fields[0]);
    }
    let start = try_with!(
        usize::from_str_radix(range[0], 16),
        "start address is not a number: {}",
        range[0]
    );
    let end = try_with!(
        usize::from_str_radix(range[1], 16),
        "end address is not a number: {}",
        range[1]
    );
    let pathname = fields.get(5).map(|p| p.trim().to_string()).unwrap_or_default();

    Ok(Mapping {
        start,
        end,
        prot_flags: parse_prot(fields[1].as_bytes()),
        pathname,
    })
}

pub fn parse_maps<R: BufRead>(reader: R) -> Result<Vec<Mapping>> {
    let mut maps = vec![];
    for line in reader.lines() {
        let line = try_with!(line, "cannot read memory maps");
        maps.push(try_with!(parse_line(&line), "cannot parse line {}", line));
    }
    Ok(maps)
}

pub fn maps(pid: Pid) -> Result<Vec<Mapping>> {
    let path = pid_path(pid).join("maps");
    let f = try_with!(File::open(&path), "cannot open {}", path.display());
    parse_maps(BufReader::new(f))
}
