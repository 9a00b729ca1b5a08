use std::collections::BTreeMap;

use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

use crate::calc::MapCalculator;
use crate::file::{FileId, FilePool, MapId, MappedFile};
use crate::map::Map;
use crate::page::PagePool;
use crate::process::Process;
use crate::sizes::Sizes;
use crate::sys::{SysError, SysInfo};
use crate::Pid;

/// The page-info endpoint is a write-pid-then-read protocol, so two
/// concurrent snapshots would race on it. One lock for the whole process.
static SNAPSHOT_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("page data source is unavailable: {0}")]
    SourceUnavailable(#[source] SysError),

    #[error("could not enumerate processes: {0}")]
    ProcessList(#[source] SysError),

    #[error("no accessible processes")]
    NoProcesses,
}

/// One complete memory-usage snapshot: every accessible process, the files
/// backing their VMAs, and the global page pool that underlies the
/// effective size measures. Built once, read-only afterwards.
pub struct Snapshot {
    page_pool: PagePool,
    file_pool: FilePool,
    procs: BTreeMap<Pid, Process>,
}

impl Snapshot {
    /// Load a snapshot from the given source.
    ///
    /// A source that cannot be reached fails the whole snapshot;
    /// individual processes that fail to load or to map are absorbed with
    /// a warning and are simply absent (or present without maps) in the
    /// result.
    pub fn load(sys_info: &dyn SysInfo) -> Result<Snapshot, SnapshotError> {
        let _guard = SNAPSHOT_LOCK.lock();

        sys_info
            .sanity_check()
            .map_err(SnapshotError::SourceUnavailable)?;
        let pids = sys_info
            .accessible_pids()
            .map_err(SnapshotError::ProcessList)?;

        let own_pid = std::process::id() as Pid;
        let mut page_pool = PagePool::default();
        let mut procs = BTreeMap::new();
        for pid in pids {
            if pid == own_pid {
                // Don't monitor ourselves.
                continue;
            }
            match Process::load(pid, sys_info, &mut page_pool) {
                Ok(process) if process.has_mm() => {
                    procs.insert(pid, process);
                }
                // Kernel threads have no VMAs and nothing to account.
                Ok(_) => {}
                Err(e) => warn!("pid {pid}: could not load process: {e}"),
            }
        }
        if procs.is_empty() {
            return Err(SnapshotError::NoProcesses);
        }

        let mut file_pool = FilePool::default();
        for (pid, process) in procs.iter_mut() {
            let calculator = MapCalculator::new(*pid, process.vmas(), &mut file_pool);
            match calculator.calc_maps() {
                Ok((maps, files)) => {
                    for (index, map) in maps.iter().enumerate() {
                        file_pool
                            .file_mut(map.file_id())
                            .add_map(MapId { pid: *pid, index });
                    }
                    process.set_maps(maps, files);
                }
                // Keep the process and its VMAs; only the maps are lost.
                Err(e) => warn!("pid {pid}: discarding maps: {e}"),
            }
        }

        Ok(Snapshot {
            page_pool,
            file_pool,
            procs,
        })
    }

    pub fn procs(&self) -> impl Iterator<Item = &Process> {
        self.procs.values()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    pub fn proc(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn files(&self) -> impl Iterator<Item = &MappedFile> {
        self.file_pool.files()
    }

    pub fn file(&self, name: &str) -> Option<&MappedFile> {
        self.file_id(name).map(|id| self.file_pool.file(id))
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.file_pool.by_name(name)
    }

    pub fn file_by_id(&self, id: FileId) -> &MappedFile {
        self.file_pool.file(id)
    }

    pub fn page_pool(&self) -> &PagePool {
        &self.page_pool
    }

    /// The total cost of a file across every process that maps it. Summed
    /// over the same maps as the per-process restrictions, so the
    /// effective measures add up to the file's physical footprint.
    pub fn file_sizes(&self, file_id: FileId) -> Sizes {
        let mut sizes = Sizes::new();
        for map_id in self.file_pool.file(file_id).maps() {
            let Some(process) = self.procs.get(&map_id.pid) else {
                continue;
            };
            let map: &Map = &process.maps()[map_id.index];
            if let Some(s) =
                map.sizes(&process.vmas()[map.vma_idx()], &self.page_pool)
            {
                sizes.add(&s);
            }
        }
        sizes
    }
}
