//! Open file descriptors of a process.

use std::{
    os::{fd::RawFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
};

use anyhow::Context;
use nix::{
    fcntl::{self, OFlag},
    sys::stat::Mode,
    unistd::{self, Whence},
};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FdInfo {
    pub fd: RawFd,
    pub path: PathBuf,
    pub flags: i32,
    pub pos: u64,
}

/// Links that cannot be reopened by path.
fn is_special(link: &Path) -> bool {
    let bytes = link.as_os_str().as_bytes();
    [&b"pipe:"[..], b"socket:", b"anon_inode:"].iter().any(|prefix| bytes.starts_with(prefix))
}

/// Parse the content of `/proc/<pid>/fdinfo/<fd>`, returning the offset and open flags.
pub fn parse_fdinfo(text: &str) -> anyhow::Result<(u64, i32)> {
    let mut pos = None;
    let mut flags = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        match key {
            "pos" => pos = Some(value.trim().parse::<u64>().context("invalid pos")?),
            "flags" => {
                flags = Some(i32::from_str_radix(value.trim(), 8).context("invalid flags")?)
            }
            _ => {}
        }
    }
    Ok((pos.context("missing pos")?, flags.context("missing flags")?))
}

/// List the file descriptors of `pid` that refer to regular paths, skipping the standard
/// streams.
pub fn list_fds(pid: i32) -> anyhow::Result<Vec<FdInfo>> {
    let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
    let mut files = vec![];

    let entries = std::fs::read_dir(&fd_dir)
        .with_context(|| format!("failed to read {}", fd_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let fd: RawFd = match entry.file_name().to_str().and_then(|x| x.parse().ok()) {
            Some(fd) => fd,
            None => continue,
        };
        if fd < 3 {
            continue;
        }

        let link = match std::fs::read_link(entry.path()) {
            Ok(link) => link,
            // The descriptor was closed while we were listing the directory.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).context("failed to read fd link"),
        };
        if is_special(&link) || link == fd_dir {
            continue;
        }

        let info_path = format!("/proc/{pid}/fdinfo/{fd}");
        let info = match std::fs::read_to_string(&info_path) {
            Ok(info) => info,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("failed to read {info_path}")),
        };
        let (pos, flags) = parse_fdinfo(&info).with_context(|| format!("in {info_path}"))?;

        files.push(FdInfo { fd, path: link, flags, pos });
    }

    files.sort_unstable_by_key(|x| x.fd);
    Ok(files)
}

/// Reopen `files` in the current process at their recorded descriptor numbers and offsets.
pub fn restore_local(files: &[FdInfo]) -> anyhow::Result<()> {
    for file in files {
        let flags = OFlag::from_bits_truncate(file.flags)
            & !(OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_EXCL);
        let new_fd = fcntl::open(&file.path, flags, Mode::empty())
            .with_context(|| format!("failed to reopen {}", file.path.display()))?;

        if new_fd != file.fd {
            let result = unistd::dup2(new_fd, file.fd);
            unistd::close(new_fd)?;
            result.with_context(|| format!("failed to restore fd {}", file.fd))?;
        }

        unistd::lseek(file.fd, file.pos as i64, Whence::SeekSet)
            .with_context(|| format!("failed to seek fd {}", file.fd))?;
    }
    Ok(())
}

/// Check that the descriptors of a process still match `recorded`.
///
/// The descriptors of another process cannot be reopened, so a remote restore only succeeds
/// when nothing changed.
pub fn verify_unchanged(recorded: &[FdInfo], current: &[FdInfo]) -> anyhow::Result<()> {
    for file in recorded {
        match current.iter().find(|x| x.fd == file.fd) {
            Some(x) if x == file => {}
            Some(x) => anyhow::bail!("fd {} changed: recorded {file:?}, found {x:?}", file.fd),
            None => anyhow::bail!("fd {} ({}) was closed", file.fd, file.path.display()),
        }
    }
    if let Some(x) = current.iter().find(|x| !recorded.iter().any(|f| f.fd == x.fd)) {
        anyhow::bail!("fd {} ({}) was opened", x.fd, x.path.display());
    }
    Ok(())
}
