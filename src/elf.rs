use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::warn;
use memmap2::Mmap;
use object::elf::{PF_R, PF_W, PF_X};
use object::{
    Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind, SegmentFlags,
    SymbolKind,
};
use thiserror::Error;

use crate::range::Range;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("{} is not a regular file", .0.display())]
    NotRegularFile(PathBuf),

    #[error("could not open {}: {}", .0.display(), .1)]
    Open(PathBuf, #[source] io::Error),

    #[error("could not map {}: {}", .0.display(), .1)]
    Map(PathBuf, #[source] io::Error),

    #[error("{} is not an ELF file", .0.display())]
    NotElf(PathBuf),

    #[error("could not parse {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] object::read::Error),
}

/// One PT_LOAD entry of the program header table.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    vaddr: u64,
    memsz: u64,
    offset: u64,
    filesz: u64,
    flags: u32,
}

impl Segment {
    /// The virtual address range the segment occupies in memory.
    pub fn mem_range(&self) -> Range {
        Range::new(self.vaddr, self.vaddr.saturating_add(self.memsz))
    }

    /// The byte range the segment occupies in the file.
    pub fn file_range(&self) -> Range {
        Range::new(self.offset, self.offset.saturating_add(self.filesz))
    }

    /// The segment's file offset (`p_offset`).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

#[derive(Clone, Debug)]
pub struct Section {
    name: String,
    addr: u64,
    size: u64,
    file_offset: u64,
    file_size: u64,
    kind: SectionKind,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mem_range(&self) -> Range {
        Range::new(self.addr, self.addr.saturating_add(self.size))
    }

    pub fn file_range(&self) -> Range {
        Range::new(self.file_offset, self.file_offset.saturating_add(self.file_size))
    }

    /// True for sections with no file backing, like `.bss`.
    pub fn is_nobits(&self) -> bool {
        self.kind == SectionKind::UninitializedData
    }
}

#[derive(Clone, Debug)]
pub struct SymbolInfo {
    name: String,
    range: Range,
    kind: SymbolKind,
}

impl SymbolInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[st_value, st_value + st_size)`.
    pub fn range(&self) -> Range {
        self.range
    }

    pub fn size(&self) -> u64 {
        self.range.size()
    }

    /// A symbol with a name and a nonzero value.
    pub fn is_defined(&self) -> bool {
        !self.name.is_empty() && self.range.start() != 0
    }

    pub fn is_func(&self) -> bool {
        self.kind == SymbolKind::Text
    }

    pub fn is_data(&self) -> bool {
        self.kind == SymbolKind::Data
    }
}

#[derive(Default)]
struct SectionData {
    sections: Vec<Section>,
    symbols: Vec<SymbolInfo>,
}

/// An ELF file on disk.
///
/// The header and program header table are read at load time; the section
/// headers and the symbol table are only read when first asked for. A
/// malformed section or symbol table degrades to "no symbols known" with a
/// warning rather than failing the load.
pub struct ElfFile {
    path: PathBuf,
    mmap: Mmap,
    kind: ObjectKind,
    segments: Vec<Segment>,
    section_data: OnceLock<SectionData>,
}

impl ElfFile {
    pub fn load(path: &Path) -> Result<ElfFile, ElfError> {
        let meta =
            fs::metadata(path).map_err(|e| ElfError::Open(path.to_path_buf(), e))?;
        if !meta.is_file() {
            return Err(ElfError::NotRegularFile(path.to_path_buf()));
        }
        if meta.len() < ELF_MAGIC.len() as u64 {
            return Err(ElfError::NotElf(path.to_path_buf()));
        }

        let file = open_as_file_owner(path, &meta)
            .map_err(|e| ElfError::Open(path.to_path_buf(), e))?;
        let mmap =
            unsafe { Mmap::map(&file) }.map_err(|e| ElfError::Map(path.to_path_buf(), e))?;
        if &mmap[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(ElfError::NotElf(path.to_path_buf()));
        }

        let object = object::File::parse(&mmap[..])
            .map_err(|e| ElfError::Parse(path.to_path_buf(), e))?;
        let kind = object.kind();
        let segments = object
            .segments()
            .map(|seg| {
                let (offset, filesz) = seg.file_range();
                let flags = match seg.flags() {
                    SegmentFlags::Elf { p_flags } => p_flags,
                    _ => 0,
                };
                Segment {
                    vaddr: seg.address(),
                    memsz: seg.size(),
                    offset,
                    filesz,
                    flags,
                }
            })
            .collect();
        drop(object);

        Ok(ElfFile {
            path: path.to_path_buf(),
            mmap,
            kind,
            segments,
            section_data: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_executable(&self) -> bool {
        self.kind == ObjectKind::Executable
    }

    pub fn is_shared_object(&self) -> bool {
        self.kind == ObjectKind::Dynamic
    }

    /// The PT_LOAD segments, in file order.
    pub fn loadable_segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn sections(&self) -> &[Section] {
        &self.section_data().sections
    }

    /// Section at the given position of [`ElfFile::sections`].
    pub fn section_by_index(&self, index: usize) -> Option<&Section> {
        self.section_data().sections.get(index)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.section_data().sections.iter().find(|s| s.name == name)
    }

    /// Sections with a nonzero virtual address.
    pub fn mappable_sections(&self) -> Vec<&Section> {
        self.section_data()
            .sections
            .iter()
            .filter(|s| s.addr != 0)
            .collect()
    }

    /// Every entry of the `.symtab` symbol table, defined or not. Empty
    /// when the file carries no symbol table.
    pub fn all_symbols(&self) -> &[SymbolInfo] {
        &self.section_data().symbols
    }

    pub fn defined_symbols(&self) -> Vec<&SymbolInfo> {
        self.section_data()
            .symbols
            .iter()
            .filter(|s| s.is_defined())
            .collect()
    }

    /// The first symbol with the given name.
    pub fn symbol(&self, name: &str) -> Option<&SymbolInfo> {
        self.section_data().symbols.iter().find(|s| s.name == name)
    }

    /// Defined symbols whose value range overlaps `mrange`.
    pub fn find_symbols_in_mem_range(&self, mrange: Range) -> Vec<&SymbolInfo> {
        self.section_data()
            .symbols
            .iter()
            .filter(|s| s.is_defined() && mrange.overlaps(s.range))
            .collect()
    }

    pub fn symbols_in_section(&self, section: &Section) -> Vec<&SymbolInfo> {
        self.find_symbols_in_mem_range(section.mem_range())
    }

    fn section_data(&self) -> &SectionData {
        self.section_data.get_or_init(|| match self.load_section_data() {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "{}: could not load section data: {e}",
                    self.path.display()
                );
                SectionData::default()
            }
        })
    }

    fn load_section_data(&self) -> Result<SectionData, object::read::Error> {
        let object = object::File::parse(&self.mmap[..])?;

        let mut sections = Vec::new();
        for section in object.sections() {
            let name = section.name()?.to_string();
            let (file_offset, file_size) = section.file_range().unwrap_or((0, 0));
            sections.push(Section {
                name,
                addr: section.address(),
                size: section.size(),
                file_offset,
                file_size,
                kind: section.kind(),
            });
        }

        let mut symbols = Vec::new();
        for symbol in object.symbols() {
            let name = symbol.name()?.to_string();
            let value = symbol.address();
            symbols.push(SymbolInfo {
                name,
                range: Range::new(value, value.saturating_add(symbol.size())),
                kind: symbol.kind(),
            });
        }

        Ok(SectionData { sections, symbols })
    }
}

/// Open `path`, temporarily assuming the file owner's euid when running as
/// root. Root-squashing network mounts map uid 0 to nobody, so reading as
/// the owner is the only way in. Best effort: if the euid juggling fails we
/// still attempt the open.
fn open_as_file_owner(path: &Path, meta: &fs::Metadata) -> io::Result<fs::File> {
    use std::os::unix::fs::MetadataExt;

    let my_euid = unsafe { libc::geteuid() };
    let owner = meta.uid();
    let assumed = my_euid == 0 && owner != 0 && unsafe { libc::seteuid(owner) } == 0;

    let file = fs::File::open(path);

    if assumed && unsafe { libc::seteuid(my_euid) } != 0 {
        warn!(
            "could not restore euid {my_euid} after opening {}",
            path.display()
        );
    }
    file
}
