//! Control of a checked process: the message protocol, both of its ends, and access to the
//! memory of the traced process.

pub mod agent;
pub mod channel;
pub mod controller;
pub mod maps;
pub mod process;
pub mod protocol;


pub use crate::{
    agent::{fatal, Agent, AgentState, Scheduler},
    channel::Channel,
    controller::{Controller, Declarations, ResumeOutcome},
    process::RemoteProcess,
    protocol::{
        IgnoredHeapRegion, MemoryRange, Message, MessageType, PrivatizationTable, ProtocolError,
        StackContext, StackRegion, TaskId,
    },
};
