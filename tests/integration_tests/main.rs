use std::collections::BTreeMap;
use std::io::Write;

use memshare::{
    Measure, Page, Pid, Range, Sizes, Snapshot, SysError, SysInfo, Vma, PAGE_SIZE,
};

/// Scenario pids sit above the kernel's PID_MAX_LIMIT so they can never
/// collide with the test runner's own pid, which snapshots skip.
const PID_A: Pid = 5_000_001;
const PID_B: Pid = 5_000_002;

#[derive(Default)]
struct FakeProcess {
    cmdline: String,
    vmas: Vec<Vma>,
    page_info: BTreeMap<u64, Vec<Page>>,
}

#[derive(Default)]
struct FakeSysInfo {
    procs: BTreeMap<Pid, FakeProcess>,
}

impl FakeSysInfo {
    fn add_process(&mut self, pid: Pid, cmdline: &str) -> &mut FakeProcess {
        let process = self.procs.entry(pid).or_default();
        process.cmdline = cmdline.to_string();
        process
    }
}

impl SysInfo for FakeSysInfo {
    fn sanity_check(&self) -> Result<(), SysError> {
        Ok(())
    }

    fn accessible_pids(&self) -> Result<Vec<Pid>, SysError> {
        Ok(self.procs.keys().copied().collect())
    }

    fn read_cmdline(&self, pid: Pid) -> String {
        self.procs
            .get(&pid)
            .map(|p| p.cmdline.clone())
            .unwrap_or_default()
    }

    fn read_vmas(&self, pid: Pid) -> Result<Vec<Vma>, SysError> {
        Ok(self.procs.get(&pid).map(|p| p.vmas.clone()).unwrap_or_default())
    }

    fn read_page_info(&self, pid: Pid) -> Result<BTreeMap<u64, Vec<Page>>, SysError> {
        Ok(self
            .procs
            .get(&pid)
            .map(|p| p.page_info.clone())
            .unwrap_or_default())
    }
}

/// A minimal ELF64 image: file header plus a single PT_LOAD program
/// header, no sections.
fn minimal_elf64(p_vaddr: u64, p_offset: u64, p_filesz: u64, p_memsz: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 64 + 56];
    buf[0..4].copy_from_slice(b"\x7fELF");
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // little endian
    buf[6] = 1; // EV_CURRENT
    buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // e_machine = EM_X86_64
    buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    buf[24..32].copy_from_slice(&p_vaddr.to_le_bytes()); // e_entry
    buf[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    buf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    buf[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
    buf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize

    let ph = &mut buf[64..];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&5u32.to_le_bytes()); // R + X
    ph[8..16].copy_from_slice(&p_offset.to_le_bytes());
    ph[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
    ph[24..32].copy_from_slice(&p_vaddr.to_le_bytes()); // p_paddr
    ph[32..40].copy_from_slice(&p_filesz.to_le_bytes());
    ph[40..48].copy_from_slice(&p_memsz.to_le_bytes());
    ph[48..56].copy_from_slice(&0x1000u64.to_le_bytes()); // p_align
    buf
}

fn write_elf(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file
}

fn page(cookie: u64) -> Page {
    Page::new(cookie, true, true)
}

/// The universal invariants every loaded snapshot upholds.
fn assert_snapshot_invariants(snapshot: &Snapshot) {
    for process in snapshot.procs() {
        let map_ranges: Vec<Range> =
            process.maps().iter().map(|m| m.mem_range()).collect();

        // Sorted, non-overlapping, contiguous cover of the VMA ranges.
        for w in map_ranges.windows(2) {
            assert!(w[0].end() <= w[1].start(), "maps unsorted or overlapping");
        }
        assert!(!Range::any_overlap(&map_ranges));
        if !map_ranges.is_empty() {
            let vma_ranges: Vec<Range> =
                process.vmas().iter().map(|v| v.range()).collect();
            assert_eq!(
                Range::merge_list(&map_ranges),
                Range::merge_list(&vma_ranges),
                "pid {}: map cover does not match vma cover",
                process.pid()
            );
        }

        for map in process.maps() {
            let vma = &process.vmas()[map.vma_idx()];
            assert!(vma.range().contains_range(map.mem_range()));
            assert!(!map.mem_range().is_empty());
            if let Some(elf_range) = map.elf_range() {
                assert_eq!(elf_range.size(), map.mem_range().size());
            }
        }

        let sizes = process.sizes(snapshot.page_pool());
        assert!(sizes.get(Measure::SoleMapped) <= sizes.get(Measure::Mapped));
        assert!(sizes.get(Measure::Resident) <= sizes.get(Measure::Mapped));
        assert!(sizes.get(Measure::Writable) <= sizes.get(Measure::Resident));
        assert!(sizes.get(Measure::EffectiveResident) <= sizes.get(Measure::Resident));
        assert!(sizes.get(Measure::EffectiveMapped) <= sizes.get(Measure::Mapped));
        assert!(sizes.get(Measure::Mapped) <= sizes.get(Measure::Vm));
    }

    // The per-process restrictions of a file add up to the file's totals:
    // they are computed over the same maps.
    for file in snapshot.files() {
        let file_id = snapshot.file_id(file.name()).unwrap();
        let mut across_procs = Sizes::new();
        for &pid in file.procs() {
            if let Some(process) = snapshot.proc(pid) {
                across_procs.add(&process.sizes_for_file(file_id, snapshot.page_pool()));
            }
        }
        assert_eq!(across_procs, snapshot.file_sizes(file_id));
    }
}

// One process, one anonymous VMA of two resident writable pages sharing a
// cookie with itself only.
#[test]
fn single_vma_without_elf() {
    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "scenario2");
    process.vmas.push(Vma::new(0x1000, 0x3000, 0, "[heap]"));
    process
        .page_info
        .insert(0x1000, vec![page(0xAA), page(0xAA)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    assert_eq!(snapshot.num_procs(), 1);
    assert_eq!(snapshot.pids(), vec![PID_A]);

    // Both page slots share cookie 0xAA.
    assert_eq!(snapshot.page_pool().count(&page(0xAA)), 2);

    let process = snapshot.proc(PID_A).unwrap();
    assert_eq!(process.cmdline(), "scenario2");
    assert_eq!(process.maps().len(), 1);
    assert_eq!(process.maps()[0].mem_range(), Range::new(0x1000, 0x3000));
    assert_eq!(process.maps()[0].elf_range(), None);

    let sizes = process.sizes(snapshot.page_pool());
    assert_eq!(sizes.get(Measure::Vm), 8192);
    assert_eq!(sizes.get(Measure::Mapped), 8192);
    assert_eq!(sizes.get(Measure::Resident), 8192);
    assert_eq!(sizes.get(Measure::Writable), 8192);
    assert_eq!(sizes.get(Measure::EffectiveMapped), 4096);
    assert_eq!(sizes.get(Measure::EffectiveResident), 4096);
    assert_eq!(sizes.get(Measure::SoleMapped), 0);

    let heap = snapshot.file("[heap]").unwrap();
    assert!(!heap.is_elf());
    assert_eq!(heap.procs().iter().copied().collect::<Vec<_>>(), vec![PID_A]);

    assert_snapshot_invariants(&snapshot);
}

// Two processes with the same layout and the same cookies: every page is
// shared two ways, so the effective sizes halve and their sum across the
// snapshot equals the physical footprint.
#[test]
fn two_processes_sharing() {
    let mut sys_info = FakeSysInfo::default();
    for pid in [PID_A, PID_B] {
        let process = sys_info.add_process(pid, "scenario3");
        process.vmas.push(Vma::new(0x1000, 0x3000, 0, "[heap]"));
        process
            .page_info
            .insert(0x1000, vec![page(0xAA), page(0xAB)]);
    }

    let snapshot = Snapshot::load(&sys_info).unwrap();
    assert_eq!(snapshot.num_procs(), 2);
    assert_eq!(snapshot.page_pool().count(&page(0xAA)), 2);
    assert_eq!(snapshot.page_pool().count(&page(0xAB)), 2);

    let mut combined = Sizes::new();
    for pid in [PID_A, PID_B] {
        let sizes = snapshot.proc(pid).unwrap().sizes(snapshot.page_pool());
        assert_eq!(sizes.get(Measure::EffectiveResident), 4096);
        assert_eq!(sizes.get(Measure::EffectiveMapped), 4096);
        assert_eq!(sizes.get(Measure::SoleMapped), 0);
        assert_eq!(sizes.get(Measure::Mapped), 8192);
        combined.add(&sizes);
    }

    // The effectiveness law: two distinct pages exist physically.
    let physical = 2 * PAGE_SIZE;
    assert_eq!(combined.get(Measure::EffectiveResident), physical);
    assert_eq!(combined.get(Measure::EffectiveMapped), physical);

    assert_snapshot_invariants(&snapshot);
}

// An ELF whose single loadable segment covers only the first page of its
// two-page VMA: the rest is a bss-like anonymous hole.
#[test]
fn elf_with_bss_hole() {
    let elf_file = write_elf(&minimal_elf64(0x8048000, 0, 0x800, 0x1000));
    let elf_path = elf_file.path().to_str().unwrap().to_string();

    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "scenario4");
    process
        .vmas
        .push(Vma::new(0x8048000, 0x804A000, 0, &elf_path));
    process
        .page_info
        .insert(0x8048000, vec![page(0xF1), page(0xF2)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let process = snapshot.proc(PID_A).unwrap();

    assert_eq!(process.maps().len(), 2);
    let seg_map = &process.maps()[0];
    assert_eq!(seg_map.mem_range(), Range::new(0x8048000, 0x8049000));
    assert_eq!(seg_map.elf_range(), Some(Range::new(0x8048000, 0x8049000)));
    let hole_map = &process.maps()[1];
    assert_eq!(hole_map.mem_range(), Range::new(0x8049000, 0x804A000));
    assert_eq!(hole_map.elf_range(), None);

    let file = snapshot.file(&elf_path).unwrap();
    assert!(file.is_elf());
    assert_eq!(file.maps().len(), 2);

    // Restricting to the file takes both maps; restricting further to the
    // first half-page of the segment takes 0x800 bytes.
    let file_id = snapshot.file_id(&elf_path).unwrap();
    let file_sizes = process.sizes_for_file(file_id, snapshot.page_pool());
    assert_eq!(file_sizes.get(Measure::Vm), 8192);

    let range_sizes = process.sizes_for_file_range(
        file_id,
        Range::new(0x8048000, 0x8048800),
        snapshot.page_pool(),
    );
    assert_eq!(range_sizes.get(Measure::Vm), 0x800);
    assert_eq!(range_sizes.get(Measure::Mapped), 0x800);
    assert_eq!(range_sizes.get(Measure::Resident), 0x800);

    assert_snapshot_invariants(&snapshot);
}

// A loadable segment that straddles two adjacent VMAs: the tail becomes an
// overrun map in the second VMA, and what is left of that VMA is an
// anonymous hole.
#[test]
fn segment_overrun_into_next_vma() {
    let elf_file = write_elf(&minimal_elf64(0x400000, 0, 0x1800, 0x1800));
    let elf_path = elf_file.path().to_str().unwrap().to_string();

    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "scenario5");
    process
        .vmas
        .push(Vma::new(0x400000, 0x401000, 0, &elf_path));
    process
        .vmas
        .push(Vma::new(0x401000, 0x402000, 0x1000, &elf_path));
    process.page_info.insert(0x400000, vec![page(0xD1)]);
    process.page_info.insert(0x401000, vec![page(0xD2)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let process = snapshot.proc(PID_A).unwrap();

    assert_eq!(process.maps().len(), 3);

    let seg_map = &process.maps()[0];
    assert_eq!(seg_map.mem_range(), Range::new(0x400000, 0x401000));
    assert_eq!(seg_map.elf_range(), Some(Range::new(0x400000, 0x401000)));
    assert_eq!(seg_map.vma_idx(), 0);

    let overrun_map = &process.maps()[1];
    assert_eq!(overrun_map.mem_range(), Range::new(0x401000, 0x401800));
    assert_eq!(
        overrun_map.elf_range(),
        Some(Range::new(0x401000, 0x401800))
    );
    assert_eq!(overrun_map.vma_idx(), 1);

    let hole_map = &process.maps()[2];
    assert_eq!(hole_map.mem_range(), Range::new(0x401800, 0x402000));
    assert_eq!(hole_map.elf_range(), None);
    assert_eq!(hole_map.vma_idx(), 1);

    // All three maps belong to the ELF file.
    let file = snapshot.file(&elf_path).unwrap();
    assert_eq!(file.maps().len(), 3);

    assert_snapshot_invariants(&snapshot);
}

// The kernel reported the VMA but an empty page block for it: the process
// stays in the snapshot and every query over that VMA is zero.
#[test]
fn empty_page_block_keeps_process() {
    let elf_file = write_elf(&minimal_elf64(0x8048000, 0, 0x800, 0x1000));
    let elf_path = elf_file.path().to_str().unwrap().to_string();

    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "scenario6");
    process
        .vmas
        .push(Vma::new(0x8048000, 0x804A000, 0, &elf_path));
    process.page_info.insert(0x8048000, Vec::new());

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let process = snapshot.proc(PID_A).unwrap();
    assert_eq!(process.vmas().len(), 1);
    assert_eq!(process.vmas()[0].num_pages(), 0);
    assert_eq!(process.maps().len(), 2);

    let file_id = snapshot.file_id(&elf_path).unwrap();
    let sizes = process.sizes_for_file_range(
        file_id,
        Range::new(0x8048000, 0x8049000),
        snapshot.page_pool(),
    );
    for measure in Measure::ALL {
        assert_eq!(sizes.get(measure), 0);
    }
    let sizes = process.sizes(snapshot.page_pool());
    for measure in Measure::ALL {
        assert_eq!(sizes.get(measure), 0);
    }

    assert_snapshot_invariants(&snapshot);
}

// A one-page [vdso] VMA that gets no page records is dropped; one that does
// get them stays.
#[test]
fn pageless_vdso_is_dropped() {
    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "vdso");
    process.vmas.push(Vma::new(0x1000, 0x2000, 0, "[heap]"));
    process
        .vmas
        .push(Vma::new(0x7fff0000, 0x7fff1000, 0, "[vdso]"));
    process.page_info.insert(0x1000, vec![page(0xAA)]);
    process.page_info.insert(0x7fff0000, Vec::new());

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let process = snapshot.proc(PID_A).unwrap();
    assert_eq!(process.vmas().len(), 1);
    assert_eq!(process.vmas()[0].fname(), "[heap]");
    assert!(snapshot.file("[vdso]").is_none());

    assert_snapshot_invariants(&snapshot);
}

// Page records for an address the maps file never mentioned are skipped
// with a warning; everything else loads.
#[test]
fn page_records_for_unknown_vma_are_skipped() {
    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "racer");
    process.vmas.push(Vma::new(0x1000, 0x2000, 0, "[heap]"));
    process.page_info.insert(0x1000, vec![page(0xAA)]);
    process.page_info.insert(0xdead000, vec![page(0xBB)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let process = snapshot.proc(PID_A).unwrap();
    assert_eq!(process.vmas().len(), 1);
    // The stray block was not counted into the pool.
    assert_eq!(snapshot.page_pool().count(&page(0xBB)), 0);
    assert_eq!(
        process.sizes(snapshot.page_pool()).get(Measure::Vm),
        PAGE_SIZE
    );

    assert_snapshot_invariants(&snapshot);
}

// Processes without VMAs are kernel threads and silently absent.
#[test]
fn kernel_threads_are_dropped() {
    let mut sys_info = FakeSysInfo::default();
    sys_info.add_process(PID_A, "kthread");
    let process = sys_info.add_process(PID_B, "user");
    process.vmas.push(Vma::new(0x1000, 0x2000, 0, "[heap]"));
    process.page_info.insert(0x1000, vec![page(0xAA)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    assert_eq!(snapshot.pids(), vec![PID_B]);
    assert!(snapshot.proc(PID_A).is_none());
}

// A fuller picture: two processes share a library-like ELF mapping, each
// with private heap pages, one with pages that were never touched.
#[test]
fn mixed_snapshot_invariants() {
    let _ = env_logger::builder().is_test(true).try_init();

    let elf_file = write_elf(&minimal_elf64(0x400000, 0, 0x2000, 0x2000));
    let elf_path = elf_file.path().to_str().unwrap().to_string();

    let mut sys_info = FakeSysInfo::default();

    let process = sys_info.add_process(PID_A, "app --one");
    process
        .vmas
        .push(Vma::new(0x400000, 0x402000, 0, &elf_path));
    process.vmas.push(Vma::new(0x600000, 0x603000, 0, "[heap]"));
    process
        .page_info
        .insert(0x400000, vec![page(0x51), page(0x52)]);
    process.page_info.insert(
        0x600000,
        vec![page(0x61), Page::new(0, false, false), Page::new(0x62, true, false)],
    );

    let process = sys_info.add_process(PID_B, "app --two");
    process
        .vmas
        .push(Vma::new(0x400000, 0x402000, 0, &elf_path));
    process.vmas.push(Vma::new(0x900000, 0x901000, 0, "[heap]"));
    process
        .page_info
        .insert(0x400000, vec![page(0x51), page(0x52)]);
    process.page_info.insert(0x900000, vec![page(0x91)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    assert_eq!(snapshot.num_procs(), 2);
    assert_snapshot_invariants(&snapshot);

    // The shared segment pages cost each process half.
    let file_id = snapshot.file_id(&elf_path).unwrap();
    let a = snapshot
        .proc(PID_A)
        .unwrap()
        .sizes_for_file(file_id, snapshot.page_pool());
    assert_eq!(a.get(Measure::Mapped), 2 * PAGE_SIZE);
    assert_eq!(a.get(Measure::EffectiveMapped), PAGE_SIZE);
    assert_eq!(a.get(Measure::SoleMapped), 0);

    // The file's total effective cost is its physical footprint.
    let file_sizes = snapshot.file_sizes(file_id);
    assert_eq!(file_sizes.get(Measure::EffectiveMapped), 2 * PAGE_SIZE);
    assert_eq!(file_sizes.get(Measure::Mapped), 4 * PAGE_SIZE);

    // Heap pages are private: sole mapped, untouched page counts VM only.
    let heap_id = snapshot.file_id("[heap]").unwrap();
    let heap_a = snapshot
        .proc(PID_A)
        .unwrap()
        .sizes_for_file(heap_id, snapshot.page_pool());
    assert_eq!(heap_a.get(Measure::Vm), 3 * PAGE_SIZE);
    assert_eq!(heap_a.get(Measure::Mapped), 2 * PAGE_SIZE);
    assert_eq!(heap_a.get(Measure::SoleMapped), 2 * PAGE_SIZE);
    assert_eq!(heap_a.get(Measure::Resident), 2 * PAGE_SIZE);
    assert_eq!(heap_a.get(Measure::Writable), PAGE_SIZE);
}

// An unusable page-info source fails the whole snapshot.
#[test]
fn unavailable_source_is_fatal() {
    struct BrokenSysInfo;
    impl SysInfo for BrokenSysInfo {
        fn sanity_check(&self) -> Result<(), SysError> {
            Err(SysError::MissingEndpoint("/proc/nowhere".into()))
        }
        fn accessible_pids(&self) -> Result<Vec<Pid>, SysError> {
            Ok(vec![])
        }
        fn read_cmdline(&self, _pid: Pid) -> String {
            String::new()
        }
        fn read_vmas(&self, _pid: Pid) -> Result<Vec<Vma>, SysError> {
            Ok(vec![])
        }
        fn read_page_info(&self, _pid: Pid) -> Result<BTreeMap<u64, Vec<Page>>, SysError> {
            Ok(BTreeMap::new())
        }
    }

    assert!(Snapshot::load(&BrokenSysInfo).is_err());
}

// Queries for pids and names that are not in the snapshot return nothing.
#[test]
fn absent_lookups_return_none() {
    let mut sys_info = FakeSysInfo::default();
    let process = sys_info.add_process(PID_A, "only");
    process.vmas.push(Vma::new(0x1000, 0x2000, 0, "[heap]"));
    process.page_info.insert(0x1000, vec![page(0xAA)]);

    let snapshot = Snapshot::load(&sys_info).unwrap();
    assert!(snapshot.proc(1).is_none());
    assert!(snapshot.file("/no/such/file").is_none());
    assert!(snapshot.file_id("/no/such/file").is_none());
}

// Effective sizes across many shared occurrences stay within one byte per
// page of the physical footprint despite flooring.
#[test]
fn effective_rounding_drift_is_bounded() {
    let mut sys_info = FakeSysInfo::default();
    // Three processes, each mapping the same three pages.
    let pids = [PID_A, PID_B, 5_000_003];
    for &pid in &pids {
        let process = sys_info.add_process(pid, "sharer");
        process.vmas.push(Vma::new(0x1000, 0x4000, 0, "[heap]"));
        process
            .page_info
            .insert(0x1000, vec![page(0x71), page(0x72), page(0x73)]);
    }

    let snapshot = Snapshot::load(&sys_info).unwrap();
    let mut combined = Sizes::new();
    for &pid in &pids {
        combined.add(&snapshot.proc(pid).unwrap().sizes(snapshot.page_pool()));
    }

    let physical = 3 * PAGE_SIZE;
    let effective = combined.get(Measure::EffectiveMapped);
    assert!(effective <= physical);
    // Flooring may lose at most a byte per (page, process) occurrence.
    assert!(physical - effective <= 9);

    assert_snapshot_invariants(&snapshot);
}
