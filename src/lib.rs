//! Sharing-aware per-process memory accounting for Linux.
//!
//! A [`Snapshot`] walks every accessible process, reconstructs its address
//! space as a contiguous sequence of [`Map`]s (each either realizing part
//! of an ELF segment of the backing file or anonymous), and attaches
//! per-page residency and sharing records from a kernel page-info source.
//! On top of that it answers "how much does this cost" for any process,
//! file, or ELF address range, in seven measures ([`Measure`]) including
//! the *effective* ones, which divide each shared page between its users so
//! that the per-process numbers add up to the real physical footprint.
//!
//! Process information comes in through the [`SysInfo`] trait;
//! [`LinuxSysInfo`] is the implementation that reads the proc filesystem
//! and the page-info control endpoint. Tests inject fakes.
//!
//! ```no_run
//! use memshare::{LinuxSysInfo, Measure, Snapshot};
//!
//! let sys_info = LinuxSysInfo::default();
//! let snapshot = Snapshot::load(&sys_info).unwrap();
//! for process in snapshot.procs() {
//!     let sizes = process.sizes(snapshot.page_pool());
//!     println!(
//!         "{:>6} {:>12} {}",
//!         process.pid(),
//!         sizes.get(Measure::EffectiveResident),
//!         process.cmdline()
//!     );
//! }
//! ```

mod calc;
pub mod elf;
mod file;
mod map;
mod page;
mod process;
mod range;
mod sizes;
mod snapshot;
mod sys;
mod vma;

/// A process id. Signed to match the kernel's pid_t.
pub type Pid = i32;

pub use calc::CalcError;
pub use elf::{ElfError, ElfFile};
pub use file::{FileId, FilePool, MapId, MappedFile};
pub use map::Map;
pub use page::{page_align_down, page_align_up, Page, PagePool, PAGE_SIZE};
pub use process::Process;
pub use range::Range;
pub use sizes::{Measure, Scale, Sizes};
pub use snapshot::{Snapshot, SnapshotError};
pub use sys::{LinuxSysInfo, SysError, SysInfo, DEFAULT_PAGE_INFO_PATH};
pub use vma::{PartialPageInfo, Vma};
