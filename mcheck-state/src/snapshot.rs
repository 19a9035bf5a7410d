use std::{
    hash::{BuildHasher, Hasher},
    rc::Rc,
};

use anyhow::Context;
use hashbrown::hash_map::DefaultHashBuilder;
use mcheck_mem::{AddressSpace, PageStore, RegionSnapshot, RegionType};
use mcheck_remote::{MemoryRange, StackRegion};

use crate::{
    fds::FdInfo,
    stack::{self, StackSnapshot},
    CheckerConfig,
};

/// The fixed memory regions of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSlot {
    Heap = 0,

    /// The data segment of the library implementing the scheduler.
    Library = 1,

    /// The data segment of the checked binary.
    Binary = 2,
}

impl RegionSlot {
    pub const ALL: [RegionSlot; 3] = [Self::Heap, Self::Library, Self::Binary];

    fn region_type(self) -> RegionType {
        match self {
            Self::Heap => RegionType::Heap,
            Self::Library | Self::Binary => RegionType::Data,
        }
    }
}

/// Private copies of the binary's data segment, one for each task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privatization {
    pub mirrors: Vec<u64>,
    pub active: Option<u64>,
}

/// Where the regions of the target's memory currently are.
#[derive(Debug, Clone, Default)]
pub struct MemoryLayout {
    pub heap: Option<MemoryRange>,
    pub library: Option<MemoryRange>,
    pub binary: Option<MemoryRange>,
    pub privatization: Option<Privatization>,
    pub heap_bytes_used: u64,
}

/// A process that can be snapshotted.
pub trait TargetProcess: AddressSpace {
    fn memory_layout(&self) -> anyhow::Result<MemoryLayout>;

    /// Ranges that are excluded from state comparison, sorted by address.
    fn ignored_ranges(&self) -> Vec<MemoryRange>;

    fn stack_areas(&self) -> Vec<StackRegion>;

    fn open_files(&self) -> anyhow::Result<Vec<FdInfo>>;

    fn restore_files(&mut self, files: &[FdInfo]) -> anyhow::Result<()>;

    /// Make the private data segment `index` the active one.
    fn select_private_segment(&mut self, index: u64) -> anyhow::Result<()>;
}

/// The original content of an ignored range.
#[derive(Debug, Clone)]
pub struct IgnoredData {
    pub addr: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Snapshot {
    num_state: u64,
    regions: [Option<RegionSnapshot>; 3],
    privatization_regions: Vec<RegionSnapshot>,
    privatization_index: Option<u64>,
    stacks: Vec<StackSnapshot>,
    ignored_data: Vec<IgnoredData>,
    open_files: Vec<FdInfo>,
    hash: u64,
    heap_bytes_used: u64,
    task_count: usize,
}

impl Snapshot {
    pub fn num_state(&self) -> u64 {
        self.num_state
    }

    pub fn region(&self, slot: RegionSlot) -> Option<&RegionSnapshot> {
        self.regions[slot as usize].as_ref()
    }

    pub fn privatization_regions(&self) -> &[RegionSnapshot] {
        &self.privatization_regions
    }

    pub fn privatization_index(&self) -> Option<u64> {
        self.privatization_index
    }

    pub fn stacks(&self) -> &[StackSnapshot] {
        &self.stacks
    }

    pub fn ignored_data(&self) -> &[IgnoredData] {
        &self.ignored_data
    }

    pub fn open_files(&self) -> &[FdInfo] {
        &self.open_files
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn heap_bytes_used(&self) -> u64 {
        self.heap_bytes_used
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }
}

/// Save the content of every ignored range and replace it with zeroes.
fn zero_ignored<P: TargetProcess + ?Sized>(process: &mut P) -> anyhow::Result<Vec<IgnoredData>> {
    let mut saved = vec![];
    for range in process.ignored_ranges() {
        let mut data = vec![0; range.size as usize];
        let mut result = process.read_bytes(range.addr, &mut data);
        if result.is_ok() {
            saved.push(IgnoredData { addr: range.addr, data });
            result = process.clear_bytes(range.addr, range.size as usize);
        }

        // Leave the process as it was if any range cannot be saved.
        if let Err(e) = result {
            if let Err(restore_err) = write_ignored(process, &saved) {
                tracing::error!("{restore_err:?}");
            }
            return Err(e).with_context(|| {
                format!("failed to clear ignored range {:#x}..{:#x}", range.addr, range.end())
            });
        }
    }
    Ok(saved)
}

fn write_ignored<P: TargetProcess + ?Sized>(
    process: &mut P,
    saved: &[IgnoredData],
) -> anyhow::Result<()> {
    // Ranges may overlap, later entries saved the zeroes written for earlier ones.
    for entry in saved.iter().rev() {
        process
            .write_bytes(entry.addr, &entry.data)
            .with_context(|| format!("failed to restore ignored data at {:#x}", entry.addr))?;
    }
    Ok(())
}

type CapturedMemory = ([Option<RegionSnapshot>; 3], Vec<RegionSnapshot>);

/// Owns everything shared between snapshots: the page store and the current diff parent.
pub struct SnapshotContext {
    config: CheckerConfig,
    pages: PageStore,

    /// The snapshot most recently taken or restored, when soft-dirty tracking is used.
    parent: Option<Rc<Snapshot>>,

    hasher: DefaultHashBuilder,
}

impl SnapshotContext {
    pub fn new(config: CheckerConfig) -> Self {
        let pages = PageStore::new(config.max_pages);
        Self { config, pages, parent: None, hasher: DefaultHashBuilder::default() }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn page_store(&self) -> &PageStore {
        &self.pages
    }

    pub fn parent(&self) -> Option<&Rc<Snapshot>> {
        self.parent.as_ref()
    }

    /// Returns whether `snapshot` is the current diff parent.
    pub fn is_parent(&self, snapshot: &Snapshot) -> bool {
        self.parent.as_deref().map_or(false, |parent| std::ptr::eq(parent, snapshot))
    }

    fn diff_parent(&self) -> Option<Rc<Snapshot>> {
        if self.config.soft_dirty { self.parent.clone() } else { None }
    }

    fn capture_region<P: TargetProcess + ?Sized>(
        &self,
        process: &P,
        region_type: RegionType,
        start_addr: u64,
        permanent_addr: u64,
        size: u64,
        reference: Option<&RegionSnapshot>,
    ) -> anyhow::Result<RegionSnapshot> {
        let region = if self.config.sparse_checkpoint {
            RegionSnapshot::sparse(
                process,
                &self.pages,
                region_type,
                start_addr,
                permanent_addr,
                size,
                reference,
            )
        } else {
            RegionSnapshot::dense(process, region_type, start_addr, permanent_addr, size)
        };
        region.with_context(|| format!("failed to capture region at {permanent_addr:#x}"))
    }

    fn capture_memory<P: TargetProcess + ?Sized>(
        &self,
        process: &P,
        layout: &MemoryLayout,
    ) -> anyhow::Result<CapturedMemory> {
        let parent = self.diff_parent();

        // With privatization, the binary's data segment is captured through its mirrors.
        let binary = layout.binary.filter(|_| layout.privatization.is_none());

        let slots = [
            (RegionSlot::Heap, layout.heap),
            (RegionSlot::Library, layout.library),
            (RegionSlot::Binary, binary),
        ];

        let mut regions: [Option<RegionSnapshot>; 3] = Default::default();
        for (slot, range) in slots {
            let Some(range) = range else { continue };
            let reference = parent.as_deref().and_then(|p| p.region(slot));
            regions[slot as usize] = Some(self.capture_region(
                process,
                slot.region_type(),
                range.addr,
                range.addr,
                range.size,
                reference,
            )?);
        }

        let mut privatization_regions = vec![];
        if let Some(privatization) = &layout.privatization {
            let binary = layout.binary.context("privatization requires the binary data segment")?;
            for (i, mirror) in privatization.mirrors.iter().enumerate() {
                let reference = parent.as_deref().and_then(|p| p.privatization_regions.get(i));
                privatization_regions.push(self.capture_region(
                    process,
                    RegionType::Data,
                    binary.addr,
                    *mirror,
                    binary.size,
                    reference,
                )?);
            }
        }

        Ok((regions, privatization_regions))
    }

    fn compute_hash(&self, snapshot: &Snapshot) -> u64 {
        let mut state = self.hasher.build_hasher();
        state.write_u64(snapshot.heap_bytes_used);
        state.write_usize(snapshot.task_count);
        state.write_u64(snapshot.privatization_index.unwrap_or(u64::MAX));
        for region in snapshot.regions.iter().flatten().chain(&snapshot.privatization_regions) {
            region.hash_content(&mut state);
        }
        for stack in &snapshot.stacks {
            state.write_u64(stack.used_size);
            for frame in &stack.frames {
                state.write_u64(frame.ip);
            }
        }
        state.finish()
    }

    /// Capture the current state of `process`.
    pub fn take_snapshot<P: TargetProcess + ?Sized>(
        &mut self,
        process: &mut P,
        num_state: u64,
    ) -> anyhow::Result<Rc<Snapshot>> {
        tracing::debug!("Taking snapshot {num_state}");

        let layout = process.memory_layout().context("failed to read memory layout")?;
        let stack_areas = process.stack_areas();

        let mut stacks = vec![];
        if self.config.unwind_stacks {
            for area in &stack_areas {
                let stack = stack::unwind_stack(&*process, area)
                    .with_context(|| format!("failed to unwind stack of task {}", area.task))?;
                stacks.push(stack);
            }
        }

        let mut open_files = vec![];
        if self.config.snapshot_fds {
            open_files = process.open_files()?;
        }

        let ignored_data = zero_ignored(process).context("failed to clear ignored memory")?;
        let captured = self.capture_memory(&*process, &layout).and_then(|memory| {
            if self.config.soft_dirty {
                process.reset_soft_dirty().context("failed to reset soft-dirty bits")?;
            }
            Ok(memory)
        });
        write_ignored(process, &ignored_data)?;
        let (regions, privatization_regions) = captured?;

        let mut snapshot = Snapshot {
            num_state,
            regions,
            privatization_regions,
            privatization_index: layout.privatization.as_ref().and_then(|x| x.active),
            stacks,
            ignored_data,
            open_files,
            hash: 0,
            heap_bytes_used: layout.heap_bytes_used,
            task_count: stack_areas.len(),
        };
        if self.config.hash {
            snapshot.hash = self.compute_hash(&snapshot);
        }

        let snapshot = Rc::new(snapshot);
        if self.config.soft_dirty {
            self.parent = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Reset the memory of `process` to the content saved in `snapshot`.
    pub fn restore_snapshot<P: TargetProcess + ?Sized>(
        &mut self,
        process: &mut P,
        snapshot: &Rc<Snapshot>,
    ) -> anyhow::Result<()> {
        tracing::debug!("Restoring snapshot {}", snapshot.num_state);
        let parent = self.diff_parent();

        for slot in RegionSlot::ALL {
            if let Some(region) = snapshot.region(slot) {
                let reference = parent.as_deref().and_then(|p| p.region(slot));
                region
                    .restore(process, reference)
                    .with_context(|| format!("failed to restore {slot:?} region"))?;
            }
        }

        for (i, region) in snapshot.privatization_regions.iter().enumerate() {
            let reference = parent.as_deref().and_then(|p| p.privatization_regions.get(i));
            region
                .restore(process, reference)
                .with_context(|| format!("failed to restore private segment {i}"))?;
        }

        // The live state may already consider this segment active, so always reselect it.
        if let Some(index) = snapshot.privatization_index {
            process.select_private_segment(index)?;
        }

        if self.config.snapshot_fds {
            process.restore_files(&snapshot.open_files).context("failed to restore files")?;
        }

        if self.config.soft_dirty {
            process.reset_soft_dirty().context("failed to reset soft-dirty bits")?;
        }
        write_ignored(process, &snapshot.ignored_data)?;

        if self.config.soft_dirty {
            self.parent = Some(snapshot.clone());
        }
        Ok(())
    }

    /// Returns whether `a` and `b` are the same state of the target.
    pub fn snapshot_equal(&self, a: &Snapshot, b: &Snapshot) -> bool {
        if a.task_count != b.task_count || a.heap_bytes_used != b.heap_bytes_used {
            return false;
        }

        if self.config.hash && a.hash != b.hash {
            tracing::trace!(
                "snapshots {} and {} differ by hash: {:#x} != {:#x}",
                a.num_state,
                b.num_state,
                a.hash,
                b.hash
            );
            return false;
        }

        if a.privatization_index != b.privatization_index {
            return false;
        }

        if a.stacks.len() != b.stacks.len()
            || a.stacks.iter().zip(&b.stacks).any(|(x, y)| !x.same_shape(y))
        {
            tracing::trace!("snapshots {} and {} differ by stacks", a.num_state, b.num_state);
            return false;
        }

        for slot in RegionSlot::ALL {
            let equal = match (a.region(slot), b.region(slot)) {
                (Some(x), Some(y)) => x.content_eq(y),
                (None, None) => true,
                _ => false,
            };
            if !equal {
                tracing::trace!(
                    "snapshots {} and {} differ in {slot:?} region",
                    a.num_state,
                    b.num_state
                );
                return false;
            }
        }

        a.privatization_regions.len() == b.privatization_regions.len()
            && a.privatization_regions
                .iter()
                .zip(&b.privatization_regions)
                .all(|(x, y)| x.content_eq(y))
    }
}
