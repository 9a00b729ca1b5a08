use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::warn;
use thiserror::Error;

use crate::page::Page;
use crate::vma::Vma;
use crate::Pid;

#[derive(Debug, Error)]
pub enum SysError {
    #[error("could not read {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] io::Error),

    #[error("could not write to {}: {}", .0.display(), .1)]
    Write(PathBuf, #[source] io::Error),

    #[error("page info endpoint {} is missing", .0.display())]
    MissingEndpoint(PathBuf),
}

/// The system-facing seam: everything the snapshot needs to know about
/// processes comes through here, so tests can plug in fakes and ports can
/// swap the backend.
pub trait SysInfo {
    /// Check that the data source is operational before starting a
    /// snapshot.
    fn sanity_check(&self) -> Result<(), SysError>;

    /// The pids whose information we are allowed to read.
    fn accessible_pids(&self) -> Result<Vec<Pid>, SysError>;

    /// The command line of a process; empty when unreadable.
    fn read_cmdline(&self, pid: Pid) -> String;

    /// The VMA list of a process, in address order, without page records.
    fn read_vmas(&self, pid: Pid) -> Result<Vec<Vma>, SysError>;

    /// The per-page records of a process, keyed by VMA start address.
    fn read_page_info(&self, pid: Pid) -> Result<BTreeMap<u64, Vec<Page>>, SysError>;
}

/// Reads the proc filesystem and the kernel page-info endpoint.
///
/// The page-info protocol is write-then-read: write a pid to the endpoint,
/// then read back one `VMA 0x<start> <npages>` header line per VMA, each
/// followed by one `<resident> <writable> <cookie>` line per page.
pub struct LinuxSysInfo {
    proc_root: PathBuf,
    page_info_path: PathBuf,
}

pub const DEFAULT_PAGE_INFO_PATH: &str = "/proc/exmap";

impl Default for LinuxSysInfo {
    fn default() -> Self {
        LinuxSysInfo::new("/proc", DEFAULT_PAGE_INFO_PATH)
    }
}

impl LinuxSysInfo {
    pub fn new(proc_root: impl Into<PathBuf>, page_info_path: impl Into<PathBuf>) -> Self {
        LinuxSysInfo {
            proc_root: proc_root.into(),
            page_info_path: page_info_path.into(),
        }
    }

    fn maps_path(&self, pid: Pid) -> PathBuf {
        self.proc_root.join(pid.to_string()).join("maps")
    }
}

impl SysInfo for LinuxSysInfo {
    fn sanity_check(&self) -> Result<(), SysError> {
        if !self.page_info_path.exists() {
            return Err(SysError::MissingEndpoint(self.page_info_path.clone()));
        }
        Ok(())
    }

    fn accessible_pids(&self) -> Result<Vec<Pid>, SysError> {
        let entries = fs::read_dir(&self.proc_root)
            .map_err(|e| SysError::Read(self.proc_root.clone(), e))?;

        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = name.parse::<Pid>() else { continue };
            // Only pids whose maps we can actually open are usable.
            if fs::File::open(self.maps_path(pid)).is_ok() {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn read_cmdline(&self, pid: Pid) -> String {
        let path = self.proc_root.join(pid.to_string()).join("cmdline");
        match fs::read_to_string(&path) {
            Ok(contents) => contents.lines().next().unwrap_or("").to_string(),
            Err(_) => String::new(),
        }
    }

    fn read_vmas(&self, pid: Pid) -> Result<Vec<Vma>, SysError> {
        let path = self.maps_path(pid);
        let contents =
            fs::read_to_string(&path).map_err(|e| SysError::Read(path.clone(), e))?;

        let mut vmas = Vec::new();
        for line in contents.lines() {
            match parse_maps_line(line) {
                Some(vma) => vmas.push(vma),
                None => warn!("pid {pid}: unparsable maps line: {line:?}"),
            }
        }
        Ok(vmas)
    }

    fn read_page_info(&self, pid: Pid) -> Result<BTreeMap<u64, Vec<Page>>, SysError> {
        fs::write(&self.page_info_path, format!("{pid}\n"))
            .map_err(|e| SysError::Write(self.page_info_path.clone(), e))?;
        let contents = fs::read_to_string(&self.page_info_path)
            .map_err(|e| SysError::Read(self.page_info_path.clone(), e))?;
        Ok(parse_page_info(pid, &contents))
    }
}

/// Parse one line of a maps file:
/// `<start>-<end> <perms> <offset> <device> <inode>   <path>`.
/// The filename starts at column 49; a line without one is anonymous.
fn parse_maps_line(line: &str) -> Option<Vma> {
    let (addresses, rest) = line.split_once(' ')?;
    let (start, end) = addresses.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let mut fields = rest.split_whitespace();
    let _perms = fields.next()?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;

    let fname = match line.get(49..).map(str::trim) {
        Some(fname) if !fname.is_empty() => fname,
        _ => "[anon]",
    };
    Some(Vma::new(start, end, offset, fname))
}

fn parse_page_info(pid: Pid, contents: &str) -> BTreeMap<u64, Vec<Page>> {
    let mut page_info: BTreeMap<u64, Vec<Page>> = BTreeMap::new();
    let mut current: Option<u64> = None;

    for line in contents.lines() {
        let line = line.trim_end();
        if line.len() < 3 {
            warn!("pid {pid}: short page info line: {line:?}");
            continue;
        }
        if let Some(rest) = line.strip_prefix("VMA ") {
            let addr = rest
                .split_whitespace()
                .next()
                .and_then(|tok| tok.strip_prefix("0x"))
                .and_then(|hex| u64::from_str_radix(hex, 16).ok());
            let Some(addr) = addr else {
                warn!("pid {pid}: bad VMA line in page info: {line:?}");
                current = None;
                continue;
            };
            page_info.entry(addr).or_default();
            current = Some(addr);
        } else if let Some(page) = Page::parse_line(line) {
            match current {
                Some(addr) => page_info.get_mut(&addr).unwrap().push(page),
                None => warn!("pid {pid}: page info line before any VMA line"),
            }
        } else {
            warn!("pid {pid}: bad page info line: {line:?}");
        }
    }
    page_info
}
