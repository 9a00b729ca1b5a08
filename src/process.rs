use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::warn;

use crate::file::FileId;
use crate::map::Map;
use crate::page::{Page, PagePool};
use crate::range::Range;
use crate::sizes::Sizes;
use crate::sys::{SysError, SysInfo};
use crate::vma::Vma;
use crate::Pid;

/// One process of a snapshot: its command line, its VMAs in address order,
/// the contiguous map cover calculated from them, and the files it
/// references.
pub struct Process {
    pid: Pid,
    cmdline: String,
    vmas: Vec<Vma>,
    maps: Vec<Map>,
    files: BTreeSet<FileId>,
}

impl Process {
    /// Read the process from the system: command line, VMA list, page
    /// records. Page records are attached to their VMA by start address
    /// and counted into the pool. A `[vdso]` VMA that ends up with no
    /// pages is dropped, since some kernels never report it.
    pub(crate) fn load(
        pid: Pid,
        sys_info: &dyn SysInfo,
        page_pool: &mut PagePool,
    ) -> Result<Process, SysError> {
        let mut cmdline = sys_info.read_cmdline(pid);
        if cmdline.is_empty() {
            cmdline = "[nocmdline]".to_string();
        }

        let vmas = sys_info.read_vmas(pid)?;
        let mut process = Process {
            pid,
            cmdline,
            vmas,
            maps: Vec::new(),
            files: BTreeSet::new(),
        };

        // A process without VMAs is a kernel thread; there are no pages to
        // read for it.
        if !process.has_mm() {
            return Ok(process);
        }

        let page_info = sys_info.read_page_info(pid)?;
        process.attach_page_info(page_info, page_pool);
        process.remove_vdso_if_nopages();
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn has_mm(&self) -> bool {
        !self.vmas.is_empty()
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }

    /// The files referenced by this process's VMAs, as pool handles.
    pub fn files(&self) -> &BTreeSet<FileId> {
        &self.files
    }

    pub fn find_vma_by_addr(&self, start: u64) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.start() == start)
    }

    /// All sizes for the whole process.
    pub fn sizes(&self, page_pool: &PagePool) -> Sizes {
        Map::sum_sizes(&self.maps, &self.vmas, page_pool)
    }

    /// Sizes restricted to the maps realized while `file_id` was current,
    /// including the anonymous holes inside its VMAs.
    pub fn sizes_for_file(&self, file_id: FileId, page_pool: &PagePool) -> Sizes {
        let maps: Vec<&Map> = self.maps_for_file(file_id).collect();
        if maps.is_empty() {
            warn!("pid {}: empty restriction to file {file_id}", self.pid);
        }
        Map::sum_sizes(maps, &self.vmas, page_pool)
    }

    /// Sizes restricted to a file and an address range within its ELF
    /// image. Each map's ELF range is intersected with `elf_range` and the
    /// intersection is translated back into process addresses.
    pub fn sizes_for_file_range(
        &self,
        file_id: FileId,
        elf_range: Range,
        page_pool: &PagePool,
    ) -> Sizes {
        let mut sizes = Sizes::new();
        for map in self.maps_for_file(file_id) {
            let Some(map_elf_range) = map.elf_range() else {
                continue;
            };
            let Some(subrange) = elf_range.intersect(map_elf_range) else {
                continue;
            };
            let Some(mem_range) = map.elf_to_mem_range(subrange) else {
                continue;
            };
            if let Some(s) =
                map.sizes_for_mem_range(&self.vmas[map.vma_idx()], page_pool, mem_range)
            {
                sizes.add(&s);
            }
        }
        sizes
    }

    fn maps_for_file(&self, file_id: FileId) -> impl Iterator<Item = &Map> {
        self.maps.iter().filter(move |m| m.file_id() == file_id)
    }

    pub(crate) fn set_maps(&mut self, maps: Vec<Map>, files: BTreeSet<FileId>) {
        self.maps = maps;
        self.files = files;
    }

    fn attach_page_info(
        &mut self,
        page_info: BTreeMap<u64, Vec<Page>>,
        page_pool: &mut PagePool,
    ) {
        for (start_address, pages) in page_info {
            let Some(vma) = self.vmas.iter_mut().find(|v| v.start() == start_address) else {
                // A process can map new areas while we are reading it.
                warn!(
                    "pid {}: no vma at {start_address:#x} for page records",
                    self.pid
                );
                continue;
            };
            page_pool.inc_pages(&pages);
            vma.add_pages(pages);
        }
    }

    fn remove_vdso_if_nopages(&mut self) {
        if let Some(pos) = self
            .vmas
            .iter()
            .position(|vma| vma.is_vdso() && vma.num_pages() == 0)
        {
            self.vmas.remove(pos);
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PID: {} {}", self.pid, self.cmdline)?;
        for map in &self.maps {
            writeln!(f, "{map}")?;
        }
        Ok(())
    }
}
