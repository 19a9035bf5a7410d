use std::process::Command;

use anyhow::Context;
use mcheck_mem::{AddressSpace, StoreResult};
use mcheck_remote::{
    maps, Controller, MemoryRange, PrivatizationTable, RemoteProcess, StackRegion,
};

use crate::{
    fds::{self, FdInfo},
    snapshot::{MemoryLayout, Privatization, TargetProcess},
    CheckerConfig,
};

/// A checked process started by us together with its control channel.
pub struct Session {
    process: RemoteProcess,
    controller: Controller,
    binary_name: String,
    library_name: Option<String>,
}

impl Session {
    pub fn spawn(command: Command, config: &CheckerConfig) -> anyhow::Result<Self> {
        let (process, controller) = RemoteProcess::spawn(command)?;
        let exe = process.executable()?;
        let binary_name = exe
            .file_name()
            .with_context(|| format!("invalid executable path: {}", exe.display()))?
            .to_string_lossy()
            .into_owned();

        Ok(Self { process, controller, binary_name, library_name: config.library_name.clone() })
    }

    pub fn process(&self) -> &RemoteProcess {
        &self.process
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Read the current value of every declared atomic proposition.
    pub fn read_propositions(&self) -> anyhow::Result<Vec<i32>> {
        let propositions = &self.controller.declarations().propositions;
        let mut values = Vec::with_capacity(propositions.len());
        for (name, addr) in propositions {
            let value = self
                .process
                .read_value::<i32>(*addr)
                .with_context(|| format!("failed to read proposition `{name}`"))?;
            values.push(value);
        }
        Ok(values)
    }

    fn read_privatization(&self, table_addr: u64) -> anyhow::Result<Option<Privatization>> {
        let table: PrivatizationTable = self
            .process
            .read_value(table_addr)
            .context("failed to read privatization table")?;
        if table.count == 0 {
            return Ok(None);
        }

        let mut mirrors = vec![0_u64; table.count as usize];
        self.process
            .read_bytes(table.regions, bytemuck::cast_slice_mut(&mut mirrors))
            .context("failed to read privatized segments")?;
        let active = u64::try_from(table.active).ok();
        Ok(Some(Privatization { mirrors, active }))
    }
}

impl AddressSpace for Session {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.process.read_bytes(addr, buf)
    }

    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> StoreResult<()> {
        self.process.write_bytes(addr, buf)
    }

    fn read_pagemap(&self, first_page: u64, out: &mut [u64]) -> StoreResult<()> {
        self.process.read_pagemap(first_page, out)
    }

    fn reset_soft_dirty(&mut self) -> StoreResult<()> {
        self.process.reset_soft_dirty()
    }
}

impl TargetProcess for Session {
    fn memory_layout(&self) -> anyhow::Result<MemoryLayout> {
        let maps = self.process.memory_maps()?;

        let heap = maps::find_heap(&maps);
        let binary = maps::find_data_segment(&maps, &self.binary_name);
        if binary.is_none() {
            tracing::warn!("no data segment found for {}", self.binary_name);
        }
        let library = match &self.library_name {
            Some(name) => Some(
                maps::find_data_segment(&maps, name)
                    .with_context(|| format!("no data segment found for {name}"))?,
            ),
            None => None,
        };

        let privatization = match self.controller.declarations().privatization_table {
            Some(addr) => self.read_privatization(addr)?,
            None => None,
        };

        Ok(MemoryLayout {
            heap,
            library,
            binary,
            privatization,
            heap_bytes_used: heap.map_or(0, |x| x.size),
        })
    }

    fn ignored_ranges(&self) -> Vec<MemoryRange> {
        self.controller.declarations().excluded_ranges()
    }

    fn stack_areas(&self) -> Vec<StackRegion> {
        self.controller.declarations().stack_areas.clone()
    }

    fn open_files(&self) -> anyhow::Result<Vec<FdInfo>> {
        fds::list_fds(self.process.pid().as_raw())
    }

    fn restore_files(&mut self, files: &[FdInfo]) -> anyhow::Result<()> {
        let current = self.open_files()?;
        fds::verify_unchanged(files, &current)
    }

    fn select_private_segment(&mut self, index: u64) -> anyhow::Result<()> {
        self.controller.restore_private_segment(index)?;
        Ok(())
    }
}
