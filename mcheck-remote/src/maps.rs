//! Parser for `/proc/<pid>/maps`.

use anyhow::Context;

use crate::protocol::MemoryRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub inode: u64,
    pub pathname: Option<String>,
}

impl MapEntry {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn range(&self) -> MemoryRange {
        MemoryRange::new(self.start, self.size())
    }

    /// The file name component of the mapped path.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.pathname.as_deref()?;
        if path.starts_with('[') {
            return None;
        }
        path.rsplit('/').next()
    }

    fn is_writable_data(&self) -> bool {
        self.perms.read && self.perms.write && !self.perms.exec && self.perms.private
    }
}

fn parse_line(line: &str) -> anyhow::Result<MapEntry> {
    let mut fields = line.split_ascii_whitespace();
    let mut next = |name: &str| fields.next().with_context(|| format!("missing {name}"));

    let (start, end) = next("address range")?.split_once('-').context("invalid address range")?;
    let start = u64::from_str_radix(start, 16).context("invalid start address")?;
    let end = u64::from_str_radix(end, 16).context("invalid end address")?;

    let perms = next("permissions")?.as_bytes();
    anyhow::ensure!(perms.len() == 4, "invalid permissions: {:?}", bstr::BStr::new(perms));
    let perms = Perms {
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        exec: perms[2] == b'x',
        private: perms[3] == b'p',
    };

    let offset = u64::from_str_radix(next("offset")?, 16).context("invalid offset")?;
    let _device = next("device")?;
    let inode = next("inode")?.parse().context("invalid inode")?;

    // The path may contain spaces, so take everything after the inode field.
    let pathname = line
        .splitn(6, |c: char| c.is_ascii_whitespace())
        .nth(5)
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(String::from);

    Ok(MapEntry { start, end, perms, offset, inode, pathname })
}

pub fn parse_maps(text: &str) -> anyhow::Result<Vec<MapEntry>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_line(line).with_context(|| format!("invalid maps entry: {line:?}")))
        .collect()
}

pub fn read_maps(pid: i32) -> anyhow::Result<Vec<MapEntry>> {
    let path = format!("/proc/{pid}/maps");
    let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
    parse_maps(&text)
}

pub fn find_heap(maps: &[MapEntry]) -> Option<MemoryRange> {
    maps.iter().find(|x| x.pathname.as_deref() == Some("[heap]")).map(MapEntry::range)
}

/// Find the writable data segment of the object named `name`, extended with the anonymous
/// mapping holding its `.bss` when one directly follows it.
///
/// Versioned names (`libfoo.so.1` for `libfoo.so`) also match.
pub fn find_data_segment(maps: &[MapEntry], name: &str) -> Option<MemoryRange> {
    let matches = |entry: &MapEntry| {
        entry.file_name().map_or(false, |file| {
            file == name || file.strip_prefix(name).map_or(false, |rest| rest.starts_with('.'))
        })
    };

    let pos = maps.iter().position(|x| matches(x) && x.is_writable_data())?;
    let mut range = maps[pos].range();
    if let Some(bss) = maps.get(pos + 1) {
        if bss.start == range.end() && bss.pathname.is_none() && bss.is_writable_data() {
            range.size += bss.size();
        }
    }
    Some(range)
}
