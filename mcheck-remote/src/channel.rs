use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use bstr::BString;
use nix::{
    errno::Errno,
    sys::socket::{self, sockopt, AddressFamily, MsgFlags, SockFlag, SockType},
};

use crate::protocol::{
    IgnoredHeapRegion, MemoryRange, Message, ProtocolError, StackRegion, ENV_SOCKET_FD,
    MESSAGE_LENGTH, PRIVATIZATION_SYMBOL,
};

/// One end of a connected `SOCK_SEQPACKET` socket carrying [Message]s.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create a connected pair of channels. Both descriptors are close-on-exec.
    pub fn pair() -> Result<(Channel, Channel), ProtocolError> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Open the channel whose descriptor is named by [ENV_SOCKET_FD].
    ///
    /// Returns `None` when the variable is not set, i.e. the process is not being checked.
    pub fn from_env() -> Result<Option<Channel>, ProtocolError> {
        let value = match std::env::var(ENV_SOCKET_FD) {
            Ok(value) => value,
            Err(std::env::VarError::NotPresent) => return Ok(None),
            Err(std::env::VarError::NotUnicode(value)) => {
                return Err(ProtocolError::InvalidEnvironment(value.to_string_lossy().into()))
            }
        };
        let fd: RawFd =
            value.parse().map_err(|_| ProtocolError::InvalidEnvironment(value.clone()))?;
        if fd < 0 {
            return Err(ProtocolError::InvalidEnvironment(value));
        }
        tracing::debug!("model checking enabled, control channel on fd {fd}");

        // Safety: the controller passes a descriptor that stays open and is owned by no one else.
        let channel = Self::new(unsafe { OwnedFd::from_raw_fd(fd) });
        channel.check_socket_type()?;
        Ok(Some(channel))
    }

    /// Ensure the underlying socket preserves message boundaries.
    pub fn check_socket_type(&self) -> Result<(), ProtocolError> {
        let actual = socket::getsockopt(&self.fd, sockopt::SockType)?;
        if actual != SockType::SeqPacket {
            return Err(ProtocolError::InvalidSocketType {
                expected: SockType::SeqPacket as i32,
                actual: actual as i32,
            });
        }
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Channel, ProtocolError> {
        Ok(Self::new(self.fd.try_clone()?))
    }

    pub fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        tracing::trace!("send: {message:?}");
        self.send_raw(&message.encode()?)
    }

    /// Send `bytes` as a single message without validating them.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        loop {
            match socket::send(self.fd.as_raw_fd(), bytes, MsgFlags::empty()) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => {
                    let err = format!("short send: {n} of {} bytes", bytes.len());
                    return Err(ProtocolError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        err,
                    )));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(ProtocolError::Closed),
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn receive(&self) -> Result<Message, ProtocolError> {
        let mut buf = [0; MESSAGE_LENGTH];
        let len = self.receive_raw(&mut buf)?;
        let message = Message::decode(&buf[..len])?;
        tracing::trace!("recv: {message:?}");
        Ok(message)
    }

    /// Receive a single message into `buf`, returning its length.
    pub fn receive_raw(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        loop {
            match socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) => return Err(ProtocolError::Closed),
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(ProtocolError::Closed),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Exclude `size` bytes at `addr` from state comparison.
    pub fn ignore_memory(&self, addr: u64, size: u64) -> Result<(), ProtocolError> {
        self.send(&Message::IgnoreMemory(MemoryRange::new(addr, size)))
    }

    pub fn ignore_heap(&self, region: IgnoredHeapRegion) -> Result<(), ProtocolError> {
        self.send(&Message::IgnoreHeap(region))
    }

    pub fn unignore_heap(&self, addr: u64, size: u64) -> Result<(), ProtocolError> {
        self.send(&Message::UnignoreHeap(MemoryRange::new(addr, size)))
    }

    /// Declare a named `i32` variable at `addr`, used as an atomic proposition.
    pub fn declare_symbol(&self, name: &str, addr: u64) -> Result<(), ProtocolError> {
        self.send(&Message::RegisterSymbol { name: BString::from(name), data: addr })
    }

    pub fn declare_stack(&self, region: StackRegion) -> Result<(), ProtocolError> {
        self.send(&Message::StackRegion(region))
    }

    /// Declare the address of the process's privatization table.
    pub fn declare_privatization(&self, table_addr: u64) -> Result<(), ProtocolError> {
        self.declare_symbol(PRIVATIZATION_SYMBOL, table_addr)
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
