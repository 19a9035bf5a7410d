//! Frame pointer unwinding of the stacks of the checked process's tasks.

use mcheck_mem::{AddressSpace, StoreResult};
use mcheck_remote::{StackContext, StackRegion, TaskId};

/// Stop unwinding after this many frames.
pub const MAX_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub ip: u64,
    pub sp: u64,
    pub frame_base: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSnapshot {
    pub task: TaskId,
    pub process_index: Option<u64>,
    pub frames: Vec<StackFrame>,

    /// The number of bytes between the saved stack pointer and the end of the stack.
    pub used_size: u64,
}

impl StackSnapshot {
    /// Returns whether both stacks are in the same call chain with the same depth.
    pub fn same_shape(&self, other: &StackSnapshot) -> bool {
        self.used_size == other.used_size
            && self.frames.len() == other.frames.len()
            && self.frames.iter().zip(&other.frames).all(|(a, b)| a.ip == b.ip)
    }
}

fn read_u64<S: AddressSpace + ?Sized>(space: &S, addr: u64) -> StoreResult<u64> {
    let mut buf = [0; 8];
    space.read_bytes(addr, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Walk the saved frame pointer chain of the task owning `area`.
///
/// Frames are laid out as `[fp] = caller fp, [fp + 8] = return address`. Unwinding stops at a
/// null or out-of-area frame pointer, or when the chain does not move towards the stack end.
pub fn unwind_stack<S: AddressSpace + ?Sized>(
    space: &S,
    area: &StackRegion,
) -> StoreResult<StackSnapshot> {
    let mut context = StackContext::default();
    space.read_bytes(area.context, bytemuck::bytes_of_mut(&mut context))?;

    let range = area.range();
    let used_size = if range.contains(context.sp) {
        range.end() - context.sp
    } else {
        tracing::warn!(
            "stack pointer {:#x} of task {} is outside of its stack {:#x}..{:#x}",
            context.sp,
            area.task,
            range.addr,
            range.end()
        );
        0
    };

    let mut frames = vec![StackFrame { ip: context.ip, sp: context.sp, frame_base: context.fp }];
    let mut fp = context.fp;
    while frames.len() < MAX_FRAMES {
        if fp == 0 || fp % 8 != 0 || !range.contains(fp) || !range.contains(fp + 8) {
            break;
        }
        let caller_fp = read_u64(space, fp)?;
        let return_addr = read_u64(space, fp + 8)?;
        if return_addr == 0 {
            break;
        }
        frames.push(StackFrame { ip: return_addr, sp: fp + 16, frame_base: caller_fp });
        if caller_fp <= fp {
            break;
        }
        fp = caller_fp;
    }

    tracing::trace!("task {}: unwound {} frames", area.task, frames.len());
    Ok(StackSnapshot { task: area.task, process_index: area.process_index, frames, used_size })
}
