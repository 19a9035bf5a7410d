use std::{
    fs::File,
    os::{
        fd::AsRawFd,
        unix::{fs::FileExt, process::CommandExt},
    },
    path::PathBuf,
    process::{Child, Command},
};

use anyhow::Context;
use bytemuck::Pod;
use mcheck_mem::{AddressSpace, StoreError, StoreResult};
use nix::{
    sys::{
        ptrace,
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    channel::Channel,
    controller::Controller,
    maps::{self, MapEntry},
    protocol::ENV_SOCKET_FD,
};

/// A checked process traced by this process, accessed through procfs.
pub struct RemoteProcess {
    pid: Pid,
    child: Option<Child>,
    mem: File,
    pagemap: File,
}

impl RemoteProcess {
    /// Start `command` as a checked process and wait until it is ready to be controlled.
    pub fn spawn(mut command: Command) -> anyhow::Result<(RemoteProcess, Controller)> {
        let (local, remote) = Channel::pair().context("failed to create control channel")?;
        let remote_fd = remote.as_raw_fd();

        command.env(ENV_SOCKET_FD, remote_fd.to_string());
        // Safety: only async-signal-safe functions are called between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(remote_fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().context("failed to start checked process")?;
        drop(remote);

        let pid = Pid::from_raw(child.id() as i32);
        tracing::info!("started checked process {pid}");

        // The checked process stops itself once it has requested to be traced.
        match waitpid(pid, Some(WaitPidFlag::__WALL)).context("waitpid")? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => anyhow::bail!("checked process did not stop at start-up: {status:?}"),
        }
        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL)
            .context("failed to set ptrace options")?;

        let process = Self::open(pid, Some(child))?;
        ptrace::cont(pid, None).context("failed to resume checked process")?;

        Ok((process, Controller::traced(local, pid)))
    }

    /// Access the memory of `pid`, which must already be traced by this process.
    pub fn attach(pid: Pid) -> anyhow::Result<RemoteProcess> {
        Self::open(pid, None)
    }

    fn open(pid: Pid, child: Option<Child>) -> anyhow::Result<RemoteProcess> {
        let mem_path = format!("/proc/{pid}/mem");
        let mem = File::options()
            .read(true)
            .write(true)
            .open(&mem_path)
            .with_context(|| format!("failed to open {mem_path}"))?;

        let pagemap_path = format!("/proc/{pid}/pagemap");
        let pagemap =
            File::open(&pagemap_path).with_context(|| format!("failed to open {pagemap_path}"))?;

        Ok(Self { pid, child, mem, pagemap })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn memory_maps(&self) -> anyhow::Result<Vec<MapEntry>> {
        maps::read_maps(self.pid.as_raw())
    }

    pub fn executable(&self) -> anyhow::Result<PathBuf> {
        let path = format!("/proc/{}/exe", self.pid);
        std::fs::read_link(&path).with_context(|| format!("failed to read {path}"))
    }

    pub fn read_value<T: Pod>(&self, addr: u64) -> StoreResult<T> {
        let mut value = T::zeroed();
        self.read_bytes(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Kill the checked process if it was started by us.
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            // The controller reaps the process when it observes its termination.
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => return,
                Ok(_) => {}
            }
            tracing::debug!("killing checked process {}", self.pid);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

impl AddressSpace for RemoteProcess {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.mem.read_exact_at(buf, addr).map_err(|e| StoreError::io(addr, buf.len(), e))
    }

    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> StoreResult<()> {
        self.mem.write_all_at(buf, addr).map_err(|e| StoreError::io(addr, buf.len(), e))
    }

    fn read_pagemap(&self, first_page: u64, out: &mut [u64]) -> StoreResult<()> {
        let offset = first_page * std::mem::size_of::<u64>() as u64;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let len = bytes.len();
        self.pagemap.read_exact_at(bytes, offset).map_err(|e| StoreError::io(offset, len, e))
    }

    fn reset_soft_dirty(&mut self) -> StoreResult<()> {
        let path = format!("/proc/{}/clear_refs", self.pid);
        std::fs::write(&path, "4").map_err(|e| StoreError::io(0, 1, e))
    }
}
