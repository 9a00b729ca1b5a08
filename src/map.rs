use std::fmt;

use log::warn;

use crate::file::FileId;
use crate::page::PagePool;
use crate::range::Range;
use crate::sizes::{Measure, Sizes};
use crate::vma::Vma;

/// A subrange of one VMA, carved so that it either wholly realizes part of
/// one ELF segment (`elf_range` holds the virtual addresses in the ELF
/// image) or is entirely anonymous.
///
/// Maps are the unit against which sizes are computed. The parent VMA is an
/// index into the owning process's VMA list, and `file_id` names the file
/// whose calculation produced the map (anonymous hole maps inside an ELF
/// file's VMAs carry that file's id).
#[derive(Clone, Copy, Debug)]
pub struct Map {
    vma_idx: usize,
    file_id: FileId,
    mem_range: Range,
    elf_range: Option<Range>,
}

impl Map {
    pub(crate) fn new(
        vma_idx: usize,
        file_id: FileId,
        mem_range: Range,
        elf_range: Option<Range>,
    ) -> Self {
        debug_assert!(
            elf_range.map_or(true, |r| r.size() == mem_range.size()),
            "elf range {elf_range:?} does not match mem range {mem_range}"
        );
        Map {
            vma_idx,
            file_id,
            mem_range,
            elf_range,
        }
    }

    pub fn vma_idx(&self) -> usize {
        self.vma_idx
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn mem_range(&self) -> Range {
        self.mem_range
    }

    pub fn elf_range(&self) -> Option<Range> {
        self.elf_range
    }

    fn elf_to_mem_offset(&self) -> u64 {
        // Constant across the map by construction.
        let elf = self.elf_range.expect("anonymous map has no elf offset");
        self.mem_range.start().wrapping_sub(elf.start())
    }

    /// Translate a subrange of the ELF image into process addresses.
    pub fn elf_to_mem_range(&self, elf_range: Range) -> Option<Range> {
        let own = self.elf_range?;
        if !own.contains_range(elf_range) {
            warn!("range {elf_range} not contained within {own}");
            return None;
        }
        Some(elf_range.add(self.elf_to_mem_offset()))
    }

    /// All sizes for the whole map.
    pub fn sizes(&self, vma: &Vma, pool: &PagePool) -> Option<Sizes> {
        self.sizes_for_mem_range(vma, pool, self.mem_range)
    }

    /// All sizes for the part of `mrange` inside this map.
    ///
    /// Every byte counts towards VM. Mapped pages (nonzero cookie) count
    /// towards MAPPED and, scaled by the inverse of the pool's share count,
    /// towards EFFECTIVE_MAPPED; resident and writable narrow it down
    /// further. The effective accumulators run in floating point and are
    /// floored at the end, which keeps the rounding drift of heavily
    /// shared pages below one byte per page.
    pub fn sizes_for_mem_range(
        &self,
        vma: &Vma,
        pool: &PagePool,
        mrange: Range,
    ) -> Option<Sizes> {
        let Some(subrange) = self.mem_range.intersect(mrange) else {
            warn!("non-overlapping range: {mrange} not within {}", self.mem_range);
            return None;
        };

        let mut sizes = Sizes::new();
        if subrange.is_empty() {
            return Some(sizes);
        }
        // A VMA whose pid produced no page records sizes to zero.
        if vma.num_pages() == 0 {
            return Some(sizes);
        }

        let info = vma.get_pages_for_range(subrange)?;

        let mut effective_resident = 0.0f64;
        let mut effective_mapped = 0.0f64;

        for ppi in &info {
            sizes.increase(Measure::Vm, ppi.bytes);

            if !ppi.page.is_mapped() {
                continue;
            }
            let count = pool.count(&ppi.page);
            if count == 0 {
                warn!(
                    "no pool count for mapped page {:#x} in {vma}",
                    ppi.page.cookie()
                );
                continue;
            }

            sizes.increase(Measure::Mapped, ppi.bytes);
            effective_mapped += ppi.bytes as f64 / count as f64;
            if count == 1 {
                sizes.increase(Measure::SoleMapped, ppi.bytes);
            }
            if ppi.page.is_resident() {
                sizes.increase(Measure::Resident, ppi.bytes);
                effective_resident += ppi.bytes as f64 / count as f64;
                if ppi.page.is_writable() {
                    sizes.increase(Measure::Writable, ppi.bytes);
                }
            }
        }

        sizes.increase(Measure::EffectiveMapped, effective_mapped as u64);
        sizes.increase(Measure::EffectiveResident, effective_resident as u64);

        if sizes.get(Measure::Vm) != subrange.size() {
            warn!(
                "size mismatch: vm size {} over range {subrange}",
                sizes.get(Measure::Vm)
            );
            return None;
        }
        Some(sizes)
    }

    /// Add up the sizes of a list of maps. Maps that fail to size (after
    /// warning) contribute nothing.
    pub fn sum_sizes<'a>(
        maps: impl IntoIterator<Item = &'a Map>,
        vmas: &[Vma],
        pool: &PagePool,
    ) -> Sizes {
        let mut sizes = Sizes::new();
        for map in maps {
            if let Some(s) = map.sizes(&vmas[map.vma_idx], pool) {
                sizes.add(&s);
            }
        }
        sizes
    }
}

impl fmt::Display for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MAP: MEM {}", self.mem_range)?;
        match self.elf_range {
            Some(elf) => write!(f, " ELF {elf}"),
            None => write!(f, " ELF none"),
        }
    }
}
