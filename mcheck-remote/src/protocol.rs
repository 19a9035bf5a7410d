//! Wire format of the messages exchanged between the controller and the checked process.
//!
//! Every message is a fixed size, `repr(C)` record starting with its [MessageType]. Both ends run
//! on the same host so fields use native endianness.

use bstr::{BStr, BString};
use bytemuck::{Pod, Zeroable};

/// The environment variable holding the descriptor number of the checked process's end of the
/// control channel.
pub const ENV_SOCKET_FD: &str = "MC_ENV_SOCKET_FD";

/// The size of the buffer used for receiving messages, larger than any valid message.
pub const MESSAGE_LENGTH: usize = 512;

/// The maximum length (including the terminator) of a symbol name in `REGISTER_SYMBOL`.
pub const SYMBOL_NAME_LENGTH: usize = 128;

/// Symbol name reserved for declaring the address of the [PrivatizationTable].
pub const PRIVATIZATION_SYMBOL: &str = "__mc_privatization";

pub type TaskId = u64;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Continue = 1,
    IgnoreHeap = 2,
    UnignoreHeap = 3,
    IgnoreMemory = 4,
    StackRegion = 5,
    RegisterSymbol = 6,
    DeadlockCheck = 7,
    DeadlockCheckReply = 8,
    Waiting = 9,
    SimcallHandle = 10,
    AssertionFailed = 11,
    ActorEnabled = 12,
    ActorEnabledReply = 13,
    Restore = 14,
}

impl MessageType {
    pub fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Continue,
            2 => Self::IgnoreHeap,
            3 => Self::UnignoreHeap,
            4 => Self::IgnoreMemory,
            5 => Self::StackRegion,
            6 => Self::RegisterSymbol,
            7 => Self::DeadlockCheck,
            8 => Self::DeadlockCheckReply,
            9 => Self::Waiting,
            10 => Self::SimcallHandle,
            11 => Self::AssertionFailed,
            12 => Self::ActorEnabled,
            13 => Self::ActorEnabledReply,
            14 => Self::Restore,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::IgnoreHeap => "IGNORE_HEAP",
            Self::UnignoreHeap => "UNIGNORE_HEAP",
            Self::IgnoreMemory => "IGNORE_MEMORY",
            Self::StackRegion => "STACK_REGION",
            Self::RegisterSymbol => "REGISTER_SYMBOL",
            Self::DeadlockCheck => "DEADLOCK_CHECK",
            Self::DeadlockCheckReply => "DEADLOCK_CHECK_REPLY",
            Self::Waiting => "WAITING",
            Self::SimcallHandle => "SIMCALL_HANDLE",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::ActorEnabled => "ACTOR_ENABLED",
            Self::ActorEnabledReply => "ACTOR_ENABLED_REPLY",
            Self::Restore => "RESTORE",
        }
    }

    /// The exact number of bytes of a message of this type on the wire.
    pub const fn wire_size(self) -> usize {
        match self {
            Self::Continue | Self::DeadlockCheck | Self::Waiting | Self::AssertionFailed => {
                std::mem::size_of::<RawHeader>()
            }
            Self::DeadlockCheckReply | Self::ActorEnabledReply => std::mem::size_of::<RawInt>(),
            Self::SimcallHandle => std::mem::size_of::<RawSimcallHandle>(),
            Self::ActorEnabled | Self::Restore => std::mem::size_of::<RawU64>(),
            Self::IgnoreMemory | Self::UnignoreHeap => std::mem::size_of::<RawRange>(),
            Self::IgnoreHeap => std::mem::size_of::<RawIgnoreHeap>(),
            Self::RegisterSymbol => std::mem::size_of::<RawRegisterSymbol>(),
            Self::StackRegion => std::mem::size_of::<RawStackRegion>(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),

    /// The message did not have the size expected for its type.
    UnexpectedSize { kind: u32, expected: usize, received: usize },

    UnknownKind(u32),

    /// A valid message arrived at a point of the protocol where it is not allowed.
    UnexpectedMessage { expected: &'static str, received: MessageType },

    InvalidSocketType { expected: i32, actual: i32 },

    SymbolTooLong(usize),

    /// A declared memory range does not fit in the address space.
    InvalidRange { kind: MessageType, addr: u64, size: u64 },

    /// The controller referred to a task unknown to the scheduler.
    UnknownTask(TaskId),

    /// The value of [ENV_SOCKET_FD] was not a valid descriptor number.
    InvalidEnvironment(String),

    /// The other end of the channel was closed.
    Closed,

    /// The checked process was killed by a signal.
    ProcessCrashed(nix::sys::signal::Signal),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "channel error: {err}"),
            Self::UnexpectedSize { kind, expected, received } => {
                let name = MessageType::from_raw(*kind).map_or("UNKNOWN", MessageType::as_str);
                write!(
                    f,
                    "unexpected size for {name} ({kind}): expected {expected} bytes, received \
                     {received} bytes"
                )
            }
            Self::UnknownKind(kind) => write!(f, "unknown message kind: {kind}"),
            Self::UnexpectedMessage { expected, received } => {
                write!(f, "unexpected message: expected {expected}, received {received}")
            }
            Self::InvalidSocketType { expected, actual } => {
                write!(f, "unexpected socket type: expected {expected}, got {actual}")
            }
            Self::SymbolTooLong(len) => write!(
                f,
                "symbol name of {len} bytes exceeds the limit of {} bytes",
                SYMBOL_NAME_LENGTH - 1
            ),
            Self::InvalidRange { kind, addr, size } => {
                write!(f, "invalid range in {kind}: {size:#x} bytes at {addr:#x}")
            }
            Self::UnknownTask(task) => write!(f, "unknown task: {task}"),
            Self::InvalidEnvironment(value) => {
                write!(f, "invalid `{ENV_SOCKET_FD}` value: {value:?}")
            }
            Self::Closed => f.write_str("channel closed by peer"),
            Self::ProcessCrashed(signal) => write!(f, "checked process killed by {signal}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<nix::Error> for ProtocolError {
    fn from(err: nix::Error) -> Self {
        Self::Io(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub addr: u64,
    pub size: u64,
}

impl MemoryRange {
    pub fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    /// The end of the range, `None` if it wraps around the address space.
    pub fn checked_end(&self) -> Option<u64> {
        self.addr.checked_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.addr <= addr && addr - self.addr < self.size
    }
}

/// Reject ranges received from the checked process that wrap around the address space.
fn checked_range(kind: MessageType, addr: u64, size: u64) -> Result<MemoryRange, ProtocolError> {
    let range = MemoryRange::new(addr, size);
    match range.checked_end() {
        Some(_) => Ok(range),
        None => Err(ProtocolError::InvalidRange { kind, addr, size }),
    }
}

/// A heap fragment whose content must not take part in state comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoredHeapRegion {
    pub block: u64,
    pub fragment: i32,
    pub address: u64,
    pub size: u64,
}

/// The stack of a task together with the location of its saved execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub task: TaskId,

    /// The lowest address of the stack.
    pub address: u64,

    /// The address of the task's saved [StackContext].
    pub context: u64,

    pub size: u64,
    pub block: u64,

    /// Index of the task's privatized data segment, if privatization is active.
    pub process_index: Option<u64>,
}

impl StackRegion {
    pub fn range(&self) -> MemoryRange {
        MemoryRange::new(self.address, self.size)
    }
}

/// Registers of a suspended task saved by its context switch.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StackContext {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

/// In-memory layout of the privatization table declared through [PRIVATIZATION_SYMBOL].
///
/// `regions` points to `count` addresses, one private copy of the data segment per task.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PrivatizationTable {
    /// The index of the active copy, or -1 when no copy is mapped.
    pub active: i64,
    pub count: u64,
    pub regions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Continue,
    DeadlockCheck,
    DeadlockCheckReply(bool),
    Waiting,
    AssertionFailed,
    SimcallHandle { task: TaskId, value: i32 },
    ActorEnabled(TaskId),
    ActorEnabledReply(bool),
    Restore(u64),
    IgnoreMemory(MemoryRange),
    IgnoreHeap(IgnoredHeapRegion),
    UnignoreHeap(MemoryRange),
    RegisterSymbol { name: BString, data: u64 },
    StackRegion(StackRegion),
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    kind: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawInt {
    kind: u32,
    value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawU64 {
    kind: u32,
    pad: u32,
    value: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawSimcallHandle {
    kind: u32,
    value: i32,
    task: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRange {
    kind: u32,
    pad: u32,
    addr: u64,
    size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawIgnoreHeap {
    kind: u32,
    fragment: i32,
    block: u64,
    address: u64,
    size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRegisterSymbol {
    kind: u32,
    pad: u32,
    name: [u8; SYMBOL_NAME_LENGTH],
    data: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawStackRegion {
    kind: u32,
    pad: u32,
    task: u64,
    address: u64,
    context: u64,
    size: u64,
    block: u64,
    process_index: i64,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Continue => MessageType::Continue,
            Self::DeadlockCheck => MessageType::DeadlockCheck,
            Self::DeadlockCheckReply(_) => MessageType::DeadlockCheckReply,
            Self::Waiting => MessageType::Waiting,
            Self::AssertionFailed => MessageType::AssertionFailed,
            Self::SimcallHandle { .. } => MessageType::SimcallHandle,
            Self::ActorEnabled(_) => MessageType::ActorEnabled,
            Self::ActorEnabledReply(_) => MessageType::ActorEnabledReply,
            Self::Restore(_) => MessageType::Restore,
            Self::IgnoreMemory(_) => MessageType::IgnoreMemory,
            Self::IgnoreHeap(_) => MessageType::IgnoreHeap,
            Self::UnignoreHeap(_) => MessageType::UnignoreHeap,
            Self::RegisterSymbol { .. } => MessageType::RegisterSymbol,
            Self::StackRegion(_) => MessageType::StackRegion,
        }
    }

    /// Returns whether this is a declaration sent by the checked process without a request.
    pub fn is_declaration(&self) -> bool {
        matches!(
            self.kind(),
            MessageType::IgnoreMemory
                | MessageType::IgnoreHeap
                | MessageType::UnignoreHeap
                | MessageType::RegisterSymbol
                | MessageType::StackRegion
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let kind = self.kind() as u32;
        let bytes = match self {
            Self::Continue | Self::DeadlockCheck | Self::Waiting | Self::AssertionFailed => {
                bytemuck::bytes_of(&RawHeader { kind, pad: 0 }).to_vec()
            }
            Self::DeadlockCheckReply(value) | Self::ActorEnabledReply(value) => {
                bytemuck::bytes_of(&RawInt { kind, value: *value as u32 }).to_vec()
            }
            Self::SimcallHandle { task, value } => {
                bytemuck::bytes_of(&RawSimcallHandle { kind, value: *value, task: *task }).to_vec()
            }
            Self::ActorEnabled(value) | Self::Restore(value) => {
                bytemuck::bytes_of(&RawU64 { kind, pad: 0, value: *value }).to_vec()
            }
            Self::IgnoreMemory(range) | Self::UnignoreHeap(range) => {
                let raw = RawRange { kind, pad: 0, addr: range.addr, size: range.size };
                bytemuck::bytes_of(&raw).to_vec()
            }
            Self::IgnoreHeap(region) => bytemuck::bytes_of(&RawIgnoreHeap {
                kind,
                fragment: region.fragment,
                block: region.block,
                address: region.address,
                size: region.size,
            })
            .to_vec(),
            Self::RegisterSymbol { name, data } => {
                if name.len() >= SYMBOL_NAME_LENGTH || name.contains(&0) {
                    return Err(ProtocolError::SymbolTooLong(name.len()));
                }
                let mut raw =
                    RawRegisterSymbol { kind, pad: 0, name: [0; SYMBOL_NAME_LENGTH], data: *data };
                raw.name[..name.len()].copy_from_slice(name);
                bytemuck::bytes_of(&raw).to_vec()
            }
            Self::StackRegion(region) => bytemuck::bytes_of(&RawStackRegion {
                kind,
                pad: 0,
                task: region.task,
                address: region.address,
                context: region.context,
                size: region.size,
                block: region.block,
                process_index: region.process_index.map_or(-1, |x| x as i64),
            })
            .to_vec(),
        };
        debug_assert_eq!(bytes.len(), self.kind().wire_size());
        Ok(bytes)
    }

    /// Decode a single message, checking that `buf` has exactly the size required by its type.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header_size = std::mem::size_of::<RawHeader>();
        if buf.len() < header_size {
            let kind = match buf {
                [a, b, c, d, ..] => u32::from_ne_bytes([*a, *b, *c, *d]),
                _ => 0,
            };
            return Err(ProtocolError::UnexpectedSize {
                kind,
                expected: header_size,
                received: buf.len(),
            });
        }

        let raw_kind = u32::from_ne_bytes(buf[..4].try_into().unwrap());
        let kind = MessageType::from_raw(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;
        if buf.len() != kind.wire_size() {
            return Err(ProtocolError::UnexpectedSize {
                kind: raw_kind,
                expected: kind.wire_size(),
                received: buf.len(),
            });
        }

        Ok(match kind {
            MessageType::Continue => Self::Continue,
            MessageType::DeadlockCheck => Self::DeadlockCheck,
            MessageType::Waiting => Self::Waiting,
            MessageType::AssertionFailed => Self::AssertionFailed,
            MessageType::DeadlockCheckReply => {
                Self::DeadlockCheckReply(bytemuck::pod_read_unaligned::<RawInt>(buf).value != 0)
            }
            MessageType::ActorEnabledReply => {
                Self::ActorEnabledReply(bytemuck::pod_read_unaligned::<RawInt>(buf).value != 0)
            }
            MessageType::SimcallHandle => {
                let raw: RawSimcallHandle = bytemuck::pod_read_unaligned(buf);
                Self::SimcallHandle { task: raw.task, value: raw.value }
            }
            MessageType::ActorEnabled => {
                Self::ActorEnabled(bytemuck::pod_read_unaligned::<RawU64>(buf).value)
            }
            MessageType::Restore => {
                Self::Restore(bytemuck::pod_read_unaligned::<RawU64>(buf).value)
            }
            MessageType::IgnoreMemory | MessageType::UnignoreHeap => {
                let raw: RawRange = bytemuck::pod_read_unaligned(buf);
                let range = checked_range(kind, raw.addr, raw.size)?;
                match kind {
                    MessageType::IgnoreMemory => Self::IgnoreMemory(range),
                    _ => Self::UnignoreHeap(range),
                }
            }
            MessageType::IgnoreHeap => {
                let raw: RawIgnoreHeap = bytemuck::pod_read_unaligned(buf);
                checked_range(kind, raw.address, raw.size)?;
                Self::IgnoreHeap(IgnoredHeapRegion {
                    block: raw.block,
                    fragment: raw.fragment,
                    address: raw.address,
                    size: raw.size,
                })
            }
            MessageType::RegisterSymbol => {
                let raw: RawRegisterSymbol = bytemuck::pod_read_unaligned(buf);
                let len = raw.name.iter().position(|x| *x == 0).unwrap_or(SYMBOL_NAME_LENGTH);
                Self::RegisterSymbol { name: BStr::new(&raw.name[..len]).into(), data: raw.data }
            }
            MessageType::StackRegion => {
                let raw: RawStackRegion = bytemuck::pod_read_unaligned(buf);
                checked_range(kind, raw.address, raw.size)?;
                Self::StackRegion(StackRegion {
                    task: raw.task,
                    address: raw.address,
                    context: raw.context,
                    size: raw.size,
                    block: raw.block,
                    process_index: (raw.process_index >= 0).then_some(raw.process_index as u64),
                })
            }
        })
    }
}
