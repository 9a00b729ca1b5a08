use std::collections::{BTreeSet, VecDeque};

use log::debug;
use thiserror::Error;

use crate::elf::Segment;
use crate::file::{FileId, FilePool};
use crate::map::Map;
use crate::range::Range;
use crate::vma::Vma;
use crate::Pid;

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("working range of vma {vma} is empty at cursor {covered_to:#x}")]
    EmptyWorkingRange { vma: Range, covered_to: u64 },

    #[error("segment {seg_mem} starts before working range {working}")]
    SegmentStartMismatch { seg_mem: Range, working: Range },

    #[error("segment {seg_mem} does not intersect working range {working}")]
    EmptySegmentIntersection { seg_mem: Range, working: Range },

    #[error("no vma left to realize segment overrun {overrun}")]
    NoVmaForOverrun { overrun: Range },

    #[error("vma {vma} is not contiguous with {previous} for segment overrun")]
    NonContiguousOverrun { vma: Range, previous: Range },

    #[error("cursor moved backwards: {addr:#x} <= {covered_to:#x}")]
    CursorWentBackwards { addr: u64, covered_to: u64 },

    #[error("no vmas left to consume through {addr:#x}")]
    NoVmasToConsume { addr: u64 },

    #[error("address {addr:#x} lies beyond the last vma")]
    PastLastVma { addr: u64 },

    #[error("segment spans more than two vmas at {addr:#x}")]
    SegmentSpansThreeVmas { addr: u64 },

    #[error("no vmas consumed for file {file}")]
    NoVmasConsumed { file: String },

    #[error("no maps produced for file {file}")]
    EmptyMapList { file: String },

    #[error("first map {map} starts before first consumed vma {vma}")]
    MapBeforeVma { map: Range, vma: Range },

    #[error("last map {map} ends before last consumed vma {vma}")]
    MapShortOfVma { map: Range, vma: Range },

    #[error("zero length map at {map}")]
    ZeroLengthMap { map: Range },

    #[error("map list is not contiguous: {previous} then {map}")]
    NonContiguousMaps { previous: Range, map: Range },

    #[error("map list is not sorted: {previous} then {map}")]
    UnsortedMaps { previous: Range, map: Range },

    #[error("overlapping map ranges")]
    OverlappingMaps,
}

/// Walks a process's VMA list in address order and carves it into a
/// contiguous sequence of [`Map`]s, using the ELF segment table of each
/// backing file. Consumed by [`MapCalculator::calc_maps`].
pub(crate) struct MapCalculator<'a> {
    pid: Pid,
    vmas: &'a [Vma],
    file_pool: &'a mut FilePool,
    /// Front-to-back queue of indices into `vmas`.
    queue: VecDeque<usize>,
    /// Everything below this address is already covered by a map.
    covered_to: u64,
    maps: Vec<Map>,
    files: BTreeSet<FileId>,
}

impl<'a> MapCalculator<'a> {
    pub(crate) fn new(pid: Pid, vmas: &'a [Vma], file_pool: &'a mut FilePool) -> Self {
        let covered_to = vmas.first().map(|v| v.start()).unwrap_or(0);
        MapCalculator {
            pid,
            vmas,
            file_pool,
            queue: (0..vmas.len()).collect(),
            covered_to,
            maps: Vec::new(),
            files: BTreeSet::new(),
        }
    }

    /// Produce the map cover and the set of files the process references.
    ///
    /// Sub-steps consume VMAs from the queue as they cover them, so the
    /// top loop just keeps going until nothing is left.
    pub(crate) fn calc_maps(mut self) -> Result<(Vec<Map>, BTreeSet<FileId>), CalcError> {
        while let Some(&vma_idx) = self.queue.front() {
            let fname = self.vmas[vma_idx].fname().to_string();
            let file_id = self.file_pool.get_or_make(&fname);
            self.file_pool.file_mut(file_id).add_proc(self.pid);
            self.files.insert(file_id);

            let group_start = self.maps.len();
            let mut consumed = Vec::new();
            if self.file_pool.file(file_id).is_elf() {
                self.calc_elf_file(file_id, &mut consumed)?;
            } else {
                self.calc_nonelf_file(file_id, &mut consumed)?;
            }
            self.check_file_maps(&fname, group_start, &consumed)?;
        }
        self.check_no_overlaps()?;
        Ok((self.maps, self.files))
    }

    /// Cover the VMAs realized by an ELF file, one loadable segment at a
    /// time. When an earlier pass over the same file already realized a
    /// segment (its projected range is behind the cursor) it is skipped;
    /// a pass that realizes nothing covers the rest of the front VMA
    /// anonymously, like the trailing part of an image after a segment
    /// overrun, or a file-backed VMA with no matching segment.
    fn calc_elf_file(
        &mut self,
        file_id: FileId,
        consumed: &mut Vec<usize>,
    ) -> Result<(), CalcError> {
        let segments: Vec<Segment> = self
            .file_pool
            .file(file_id)
            .elf()
            .map(|elf| elf.loadable_segments().to_vec())
            .unwrap_or_default();
        let entry_covered_to = self.covered_to;

        for seg in &segments {
            let Some(&vma_idx) = self.queue.front() else {
                break;
            };
            let vma = &self.vmas[vma_idx];
            let seg_to_mem = seg_to_mem(seg, vma);
            let seg_mem = seg.mem_range().add(seg_to_mem);
            if seg_mem.end() <= self.covered_to {
                continue;
            }

            let overrun = self.calc_seg_map(seg, seg_to_mem, seg_mem, vma_idx, file_id)?;
            let vma_end = self.vmas[vma_idx].end();
            self.consume_to(vma_end, consumed)?;

            if let Some(overrun_elf) = overrun {
                let overrun_mem = overrun_elf.add(seg_to_mem);
                let Some(&next_idx) = self.queue.front() else {
                    return Err(CalcError::NoVmaForOverrun {
                        overrun: overrun_mem,
                    });
                };
                let next = &self.vmas[next_idx];
                if next.start() != vma_end {
                    return Err(CalcError::NonContiguousOverrun {
                        vma: next.range(),
                        previous: self.vmas[vma_idx].range(),
                    });
                }
                let map = Map::new(next_idx, file_id, overrun_mem, Some(overrun_elf));
                debug!("pid {}: overrun map {map}", self.pid);
                self.maps.push(map);
                self.consume_to(overrun_mem.end(), consumed)?;
            }
        }

        if self.covered_to == entry_covered_to {
            // No segment realized anything here.
            self.calc_nonelf_file(file_id, consumed)?;
        }
        Ok(())
    }

    /// Emit the maps for one segment within the front VMA: an anonymous
    /// start hole when the segment begins past the cursor, the segment map
    /// itself, and an anonymous end hole up to the VMA end (a `.bss`-like
    /// gap). Returns the ELF range of any overrun into the next VMA.
    fn calc_seg_map(
        &mut self,
        seg: &Segment,
        seg_to_mem: u64,
        seg_mem: Range,
        vma_idx: usize,
        file_id: FileId,
    ) -> Result<Option<Range>, CalcError> {
        let vma = &self.vmas[vma_idx];
        let working = vma.range().truncate_below(self.covered_to);
        if working.is_empty() {
            return Err(CalcError::EmptyWorkingRange {
                vma: vma.range(),
                covered_to: self.covered_to,
            });
        }
        if seg_mem.start() < working.start() {
            return Err(CalcError::SegmentStartMismatch { seg_mem, working });
        }

        let sub = match seg_mem.intersect(working) {
            Some(sub) if !sub.is_empty() => sub,
            _ => return Err(CalcError::EmptySegmentIntersection { seg_mem, working }),
        };

        if seg_mem.start() > working.start() {
            let start_hole = Range::new(working.start(), seg_mem.start());
            let map = Map::new(vma_idx, file_id, start_hole, None);
            debug!("pid {}: start hole {map}", self.pid);
            self.maps.push(map);
        }

        let elf_sub = sub.subtract(seg_to_mem);
        let map = Map::new(vma_idx, file_id, sub, Some(elf_sub));
        debug!("pid {}: segment map {map}", self.pid);
        self.maps.push(map);

        if sub.end() < vma.end() {
            let end_hole = Range::new(sub.end(), vma.end());
            let map = Map::new(vma_idx, file_id, end_hole, None);
            debug!("pid {}: end hole {map}", self.pid);
            self.maps.push(map);
        }

        // The segment may extend past this VMA into the next one.
        let seg_elf_end = seg.mem_range().end();
        if elf_sub.end() < seg_elf_end {
            Ok(Some(Range::new(elf_sub.end(), seg_elf_end)))
        } else {
            Ok(None)
        }
    }

    /// Cover the rest of the front VMA with a single anonymous map.
    fn calc_nonelf_file(
        &mut self,
        file_id: FileId,
        consumed: &mut Vec<usize>,
    ) -> Result<(), CalcError> {
        let Some(&vma_idx) = self.queue.front() else {
            return Err(CalcError::NoVmasToConsume {
                addr: self.covered_to,
            });
        };
        let vma = &self.vmas[vma_idx];
        let working = vma.range().truncate_below(self.covered_to);
        if working.is_empty() {
            return Err(CalcError::EmptyWorkingRange {
                vma: vma.range(),
                covered_to: self.covered_to,
            });
        }
        self.consume_to(working.end(), consumed)?;
        let map = Map::new(vma_idx, file_id, working, None);
        debug!("pid {}: anonymous map {map}", self.pid);
        self.maps.push(map);
        Ok(())
    }

    /// Advance the cursor to `addr`, popping the front VMA once covered.
    /// `addr` may reach into the next VMA (segment overrun) but never
    /// beyond it.
    fn consume_to(&mut self, addr: u64, consumed: &mut Vec<usize>) -> Result<(), CalcError> {
        if addr <= self.covered_to {
            return Err(CalcError::CursorWentBackwards {
                addr,
                covered_to: self.covered_to,
            });
        }
        let Some(&front) = self.queue.front() else {
            return Err(CalcError::NoVmasToConsume { addr });
        };
        self.covered_to = addr;

        let vma_end = self.vmas[front].end();
        if addr < vma_end {
            return Ok(());
        }
        consumed.push(front);
        self.queue.pop_front();
        if addr == vma_end {
            return Ok(());
        }

        let Some(&next) = self.queue.front() else {
            return Err(CalcError::PastLastVma { addr });
        };
        if addr >= self.vmas[next].end() {
            return Err(CalcError::SegmentSpansThreeVmas { addr });
        }
        Ok(())
    }

    /// The maps carved for one file must tile the consumed VMAs, jumping
    /// only at a VMA boundary.
    fn check_file_maps(
        &self,
        fname: &str,
        group_start: usize,
        consumed: &[usize],
    ) -> Result<(), CalcError> {
        let maps = &self.maps[group_start..];
        let Some(&first_vma) = consumed.first() else {
            return Err(CalcError::NoVmasConsumed {
                file: fname.to_string(),
            });
        };
        let (Some(first_map), Some(last_map)) = (maps.first(), maps.last()) else {
            return Err(CalcError::EmptyMapList {
                file: fname.to_string(),
            });
        };

        if first_map.mem_range().start() < self.vmas[first_vma].start() {
            return Err(CalcError::MapBeforeVma {
                map: first_map.mem_range(),
                vma: self.vmas[first_vma].range(),
            });
        }
        // The last map may end past the last consumed VMA (overrun into a
        // VMA that stays in the queue), but never short of it.
        let &last_vma = consumed.last().unwrap();
        if last_map.mem_range().end() < self.vmas[last_vma].end() {
            return Err(CalcError::MapShortOfVma {
                map: last_map.mem_range(),
                vma: self.vmas[last_vma].range(),
            });
        }

        let mut previous: Option<&Map> = None;
        for map in maps {
            if map.mem_range().is_empty() {
                return Err(CalcError::ZeroLengthMap {
                    map: map.mem_range(),
                });
            }
            if let Some(prev) = previous {
                if prev.mem_range().end() != map.mem_range().start() {
                    // A jump is fine exactly at a VMA boundary.
                    let prev_vma = &self.vmas[prev.vma_idx()];
                    let map_vma = &self.vmas[map.vma_idx()];
                    let at_boundary = prev.mem_range().end() == prev_vma.end()
                        && map.mem_range().start() == map_vma.start();
                    if !at_boundary {
                        return Err(CalcError::NonContiguousMaps {
                            previous: prev.mem_range(),
                            map: map.mem_range(),
                        });
                    }
                }
            }
            previous = Some(map);
        }
        Ok(())
    }

    fn check_no_overlaps(&self) -> Result<(), CalcError> {
        let mut previous: Option<Range> = None;
        for map in &self.maps {
            if let Some(prev) = previous {
                if map.mem_range().start() < prev.end() {
                    return Err(CalcError::UnsortedMaps {
                        previous: prev,
                        map: map.mem_range(),
                    });
                }
            }
            previous = Some(map.mem_range());
        }
        let ranges: Vec<Range> = self.maps.iter().map(|m| m.mem_range()).collect();
        if Range::any_overlap(&ranges) {
            return Err(CalcError::OverlappingMaps);
        }
        Ok(())
    }
}

/// The offset that turns the segment's ELF virtual addresses into this
/// process's memory addresses. It is an invariant of the VMA's relation to
/// its ELF image: every segment the VMA realizes shares it.
fn seg_to_mem(seg: &Segment, vma: &Vma) -> u64 {
    let segmem_base = seg.mem_range().start().wrapping_sub(seg.offset());
    let vmamem_base = vma.start().wrapping_sub(vma.offset());
    vmamem_base.wrapping_sub(segmem_base)
}
