//! State capture, restoration and comparison for model checking a remote process.

pub mod fds;
pub mod session;
pub mod snapshot;
pub mod stack;
pub mod visited;

mod config;


pub use crate::{
    config::{parse_u64_with_prefix, CheckerConfig},
    session::Session,
    snapshot::{MemoryLayout, Privatization, RegionSlot, Snapshot, SnapshotContext, TargetProcess},
    visited::{VisitedEntry, VisitedPair, VisitedState, VisitedStore},
};
