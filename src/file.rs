use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use log::warn;
use rustc_hash::FxHashMap;

use crate::elf::{ElfError, ElfFile};
use crate::Pid;

/// Stable handle to a file in the [`FilePool`].
pub type FileId = usize;

/// Handle to a map owned by a process: the pid plus the index into that
/// process's map list. Files record these instead of holding the maps
/// themselves, so the ownership graph stays acyclic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapId {
    pub pid: Pid,
    pub index: usize,
}

/// The identity of a backing file: its name, its ELF reader when the name
/// points at a readable ELF file, the processes that reference it, and
/// handles to every map that realizes it.
pub struct MappedFile {
    name: String,
    elf: Option<ElfFile>,
    procs: BTreeSet<Pid>,
    maps: Vec<MapId>,
}

impl MappedFile {
    pub(crate) fn new(name: &str) -> Self {
        let path = Path::new(name);
        let is_regular = fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
        let elf = if is_regular {
            match ElfFile::load(path) {
                Ok(elf) => Some(elf),
                // A regular file without the magic is simply not ELF.
                Err(ElfError::NotElf(_)) => None,
                Err(e) => {
                    warn!("{name}: unusable as ELF: {e}");
                    None
                }
            }
        } else {
            None
        };
        MappedFile {
            name: name.to_string(),
            elf,
            procs: BTreeSet::new(),
            maps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_elf(&self) -> bool {
        self.elf.is_some()
    }

    pub fn elf(&self) -> Option<&ElfFile> {
        self.elf.as_ref()
    }

    /// Pids of the processes that map this file.
    pub fn procs(&self) -> &BTreeSet<Pid> {
        &self.procs
    }

    /// Handles to the maps, across all processes, carved while this file
    /// was the current file of the map calculator. Includes the anonymous
    /// hole maps inside its VMAs.
    pub fn maps(&self) -> &[MapId] {
        &self.maps
    }

    pub(crate) fn add_proc(&mut self, pid: Pid) {
        self.procs.insert(pid);
    }

    pub(crate) fn add_map(&mut self, id: MapId) {
        self.maps.push(id);
    }
}

/// Deduplicating registry of files by name.
#[derive(Default)]
pub struct FilePool {
    files: Vec<MappedFile>,
    by_name: FxHashMap<String, FileId>,
}

impl FilePool {
    pub fn get_or_make(&mut self, name: &str) -> FileId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.files.len();
        self.files.push(MappedFile::new(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn by_name(&self, name: &str) -> Option<FileId> {
        self.by_name.get(name).copied()
    }

    pub fn file(&self, id: FileId) -> &MappedFile {
        &self.files[id]
    }

    pub(crate) fn file_mut(&mut self, id: FileId) -> &mut MappedFile {
        &mut self.files[id]
    }

    pub fn files(&self) -> impl Iterator<Item = &MappedFile> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
