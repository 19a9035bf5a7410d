//! The checker side of the protocol.

use std::os::fd::AsFd;

use bstr::BString;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::{
        ptrace,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    channel::Channel,
    protocol::{
        IgnoredHeapRegion, MemoryRange, Message, ProtocolError, StackRegion, TaskId,
        PRIVATIZATION_SYMBOL,
    },
};

/// Everything the checked process declared about its memory.
#[derive(Debug, Default, Clone)]
pub struct Declarations {
    /// Sorted, non-overlapping ranges excluded from comparison.
    pub ignored_regions: Vec<MemoryRange>,

    /// Heap fragments excluded from comparison, sorted by address.
    pub ignored_heap: Vec<IgnoredHeapRegion>,

    pub stack_areas: Vec<StackRegion>,

    /// Atomic propositions: the name and remote address of an `i32` variable.
    pub propositions: Vec<(BString, u64)>,

    /// Remote address of the privatization table, if one was declared.
    pub privatization_table: Option<u64>,
}

impl Declarations {
    /// Add `range` to the ignored regions, merging it with any region it overlaps or touches.
    pub fn ignore_region(&mut self, range: MemoryRange) {
        if range.size == 0 {
            return;
        }
        let Some(mut end) = range.checked_end() else {
            tracing::warn!("ignoring invalid range: {:#x} bytes at {:#x}", range.size, range.addr);
            return;
        };

        let mut start = range.addr;
        let first = self.ignored_regions.partition_point(|r| r.end() < start);
        let mut last = first;
        while let Some(r) = self.ignored_regions.get(last) {
            if r.addr > end {
                break;
            }
            start = start.min(r.addr);
            end = end.max(r.end());
            last += 1;
        }
        self.ignored_regions.drain(first..last);
        self.ignored_regions.insert(first, MemoryRange::new(start, end - start));
    }

    pub fn ignore_heap(&mut self, region: IgnoredHeapRegion) {
        match self.ignored_heap.binary_search_by_key(&region.address, |r| r.address) {
            Ok(_) => {}
            Err(pos) => self.ignored_heap.insert(pos, region),
        }
    }

    pub fn unignore_heap(&mut self, range: MemoryRange) {
        if let Ok(pos) = self.ignored_heap.binary_search_by_key(&range.addr, |r| r.address) {
            self.ignored_heap.remove(pos);
        }
    }

    pub fn register_symbol(&mut self, name: BString, addr: u64) {
        if name == PRIVATIZATION_SYMBOL {
            self.privatization_table = Some(addr);
            return;
        }
        match self.propositions.iter_mut().find(|(x, _)| *x == name) {
            Some(entry) => entry.1 = addr,
            None => self.propositions.push((name, addr)),
        }
    }

    pub fn declare_stack(&mut self, region: StackRegion) {
        match self.stack_areas.iter_mut().find(|x| x.task == region.task) {
            Some(entry) => *entry = region,
            None => self.stack_areas.push(region),
        }
    }

    /// The tasks that declared a stack, in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.stack_areas.iter().map(|x| x.task)
    }

    /// Every range excluded from comparison, including ignored heap fragments.
    pub fn excluded_ranges(&self) -> Vec<MemoryRange> {
        let mut ranges = self.ignored_regions.clone();
        ranges.extend(self.ignored_heap.iter().map(|x| MemoryRange::new(x.address, x.size)));
        ranges.sort_unstable_by_key(|x| x.addr);
        ranges
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Every task of the checked process is blocked.
    Waiting,

    /// The checked process reported a property violation.
    AssertionFailed,
}

/// How long to wait for a message before checking whether the traced process stopped.
const TRACEE_POLL_INTERVAL_MS: u16 = 100;

/// Handle wait events of the traced process until it runs again.
///
/// Stops are resumed with their signal reinjected. An exit is reported as [ProtocolError::Closed]
/// and a fatal signal as [ProtocolError::ProcessCrashed].
fn serve_tracee(pid: Pid, flags: WaitPidFlag) -> Result<(), ProtocolError> {
    loop {
        match waitpid(pid, Some(flags | WaitPidFlag::__WALL))? {
            WaitStatus::StillAlive => return Ok(()),
            WaitStatus::Stopped(_, signal) => {
                tracing::debug!("checked process stopped by {signal}, resuming");
                ptrace::cont(pid, Some(signal))?;
            }
            WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => {
                ptrace::cont(pid, None)?;
            }
            WaitStatus::Exited(_, code) => {
                tracing::info!("checked process exited with status {code}");
                return Err(ProtocolError::Closed);
            }
            WaitStatus::Signaled(_, signal, _) => {
                tracing::error!("checked process killed by {signal}");
                return Err(ProtocolError::ProcessCrashed(signal));
            }
            WaitStatus::Continued(_) => {}
        }
    }
}

pub struct Controller {
    channel: Channel,
    declarations: Declarations,

    /// The checked process, when it is traced by this process and still running.
    tracee: Option<Pid>,
}

impl Controller {
    pub fn new(channel: Channel) -> Self {
        Self { channel, declarations: Declarations::default(), tracee: None }
    }

    /// Control the process `pid`, which is traced by this process, through `channel`.
    ///
    /// While waiting for replies the controller resumes the process from signal stops and
    /// reports its termination.
    pub fn traced(channel: Channel, pid: Pid) -> Self {
        Self { tracee: Some(pid), ..Self::new(channel) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    /// Record a declaration sent by the checked process. Returns `false` for other messages.
    pub fn handle_message(&mut self, message: &Message) -> bool {
        tracing::debug!("Received {}", message.kind());
        match message {
            Message::IgnoreMemory(range) => self.declarations.ignore_region(*range),
            Message::IgnoreHeap(region) => self.declarations.ignore_heap(*region),
            Message::UnignoreHeap(range) => self.declarations.unignore_heap(*range),
            Message::RegisterSymbol { name, data } => {
                self.declarations.register_symbol(name.clone(), *data)
            }
            Message::StackRegion(region) => self.declarations.declare_stack(*region),
            _ => return false,
        }
        true
    }

    /// Receive the next message that is not a declaration.
    fn receive(&mut self) -> Result<Message, ProtocolError> {
        loop {
            let message = match self.wait_readable().and_then(|()| self.channel.receive()) {
                Err(ProtocolError::Closed) => return Err(self.reap()),
                result => result?,
            };
            if !self.handle_message(&message) {
                return Ok(message);
            }
        }
    }

    /// Block until a message can be received, serving stops of the traced process meanwhile.
    fn wait_readable(&mut self) -> Result<(), ProtocolError> {
        let Some(pid) = self.tracee else { return Ok(()) };
        loop {
            let mut fds = [PollFd::new(self.channel.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(TRACEE_POLL_INTERVAL_MS)) {
                Ok(0) => {}
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }

            if let Err(err) = serve_tracee(pid, WaitPidFlag::WNOHANG) {
                self.tracee = None;
                return Err(err);
            }
        }
    }

    /// Wait for the traced process to terminate after it closed the channel.
    fn reap(&mut self) -> ProtocolError {
        let Some(pid) = self.tracee.take() else { return ProtocolError::Closed };
        match serve_tracee(pid, WaitPidFlag::empty()) {
            Err(err @ ProtocolError::ProcessCrashed(_)) => err,
            _ => ProtocolError::Closed,
        }
    }

    fn wait_for_requests(&mut self) -> Result<ResumeOutcome, ProtocolError> {
        match self.receive()? {
            Message::Waiting => Ok(ResumeOutcome::Waiting),
            Message::AssertionFailed => Ok(ResumeOutcome::AssertionFailed),
            other => {
                Err(ProtocolError::UnexpectedMessage { expected: "WAITING", received: other.kind() })
            }
        }
    }

    /// Let the checked process run until all of its tasks are blocked.
    pub fn resume(&mut self) -> Result<ResumeOutcome, ProtocolError> {
        self.channel.send(&Message::Continue)?;
        self.wait_for_requests()
    }

    pub fn deadlock_check(&mut self) -> Result<bool, ProtocolError> {
        self.channel.send(&Message::DeadlockCheck)?;
        match self.receive()? {
            Message::DeadlockCheckReply(value) => Ok(value),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "DEADLOCK_CHECK_REPLY",
                received: other.kind(),
            }),
        }
    }

    pub fn actor_enabled(&mut self, task: TaskId) -> Result<bool, ProtocolError> {
        self.channel.send(&Message::ActorEnabled(task))?;
        match self.receive()? {
            Message::ActorEnabledReply(value) => Ok(value),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "ACTOR_ENABLED_REPLY",
                received: other.kind(),
            }),
        }
    }

    /// Complete the pending blocking call of `task`.
    pub fn handle_simcall(
        &mut self,
        task: TaskId,
        value: i32,
    ) -> Result<ResumeOutcome, ProtocolError> {
        self.channel.send(&Message::SimcallHandle { task, value })?;
        self.wait_for_requests()
    }

    /// Make the privatized data segment `index` the active one, without waiting for a reply.
    pub fn restore_private_segment(&mut self, index: u64) -> Result<(), ProtocolError> {
        self.channel.send(&Message::Restore(index))
    }
}
