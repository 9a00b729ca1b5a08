use std::fmt;

use log::warn;

use crate::page::{page_align_down, Page, PAGE_SIZE};
use crate::range::Range;

/// One contribution of a page slot to a measured range: the page record
/// and how many of its bytes fall inside the range.
#[derive(Clone, Copy, Debug)]
pub struct PartialPageInfo {
    pub page: Page,
    pub bytes: u64,
}

/// One virtual memory area of a process, i.e. one line of its maps file,
/// together with the per-page records attached from the page-info source.
#[derive(Clone, Debug)]
pub struct Vma {
    range: Range,
    offset: u64,
    fname: String,
    pages: Vec<Page>,
}

impl Vma {
    pub fn new(start: u64, end: u64, offset: u64, fname: &str) -> Self {
        Vma {
            range: Range::new(start, end),
            offset,
            fname: fname.to_string(),
            pages: Vec::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.range.start()
    }

    pub fn end(&self) -> u64 {
        self.range.end()
    }

    pub fn range(&self) -> Range {
        self.range
    }

    /// The file offset of the VMA's first byte. Only meaningful for a
    /// file-backed VMA.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn fname(&self) -> &str {
        &self.fname
    }

    pub fn vm_size(&self) -> u64 {
        self.range.size()
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Attach the page records, first page first. Called at most once.
    pub fn add_pages(&mut self, pages: Vec<Page>) {
        debug_assert!(self.pages.is_empty(), "pages attached twice to {}", self);
        self.pages = pages;
    }

    /// Bracketed names like `[heap]`, `[stack]` or `[anon]` have no backing
    /// file.
    pub fn is_file_backed(&self) -> bool {
        if self.fname.is_empty() {
            warn!("zero length file name in vma {}", self.range);
            return false;
        }
        !(self.fname.starts_with('[') && self.fname.ends_with(']'))
    }

    pub fn is_vdso(&self) -> bool {
        self.fname == "[vdso]"
    }

    /// Index into the page vector for an address inside the VMA.
    pub fn addr_to_pgnum(&self, addr: u64) -> Option<usize> {
        if !self.range.contains(addr) {
            warn!("{addr:#x} is outside vma {}", self.range);
            return None;
        }
        Some(((page_align_down(addr) - self.start()) / PAGE_SIZE) as usize)
    }

    /// Split `mrange`, which must lie inside the VMA, into per-page-slot
    /// byte contributions. The first and last slots may contribute less
    /// than a page when `mrange` is not page-aligned.
    pub fn get_pages_for_range(&self, mrange: Range) -> Option<Vec<PartialPageInfo>> {
        if mrange.is_empty() {
            warn!("get_pages_for_range: empty range {mrange}");
            return None;
        }
        if !self.range.contains_range(mrange) {
            warn!("get_pages_for_range: {mrange} outside vma {}", self);
            return None;
        }

        let start_pgnum = self.addr_to_pgnum(mrange.start())?;
        let end_pgnum = self.addr_to_pgnum(mrange.end() - 1)?;
        if end_pgnum >= self.pages.len() {
            warn!(
                "get_pages_for_range: page {end_pgnum} out of range ({} pages) in {}",
                self.pages.len(),
                self
            );
            return None;
        }

        if start_pgnum == end_pgnum {
            return Some(vec![PartialPageInfo {
                page: self.pages[start_pgnum],
                bytes: mrange.size(),
            }]);
        }

        let mut info = Vec::with_capacity(end_pgnum - start_pgnum + 1);
        info.push(PartialPageInfo {
            page: self.pages[start_pgnum],
            bytes: PAGE_SIZE - (mrange.start() - page_align_down(mrange.start())),
        });
        for pgnum in start_pgnum + 1..end_pgnum {
            info.push(PartialPageInfo {
                page: self.pages[pgnum],
                bytes: PAGE_SIZE,
            });
        }
        info.push(PartialPageInfo {
            page: self.pages[end_pgnum],
            bytes: mrange.end() - page_align_down(mrange.end() - 1),
        });
        Some(info)
    }
}

impl fmt::Display for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#x} {}", self.range, self.offset, self.fname)
    }
}
