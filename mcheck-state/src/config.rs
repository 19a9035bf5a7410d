use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CheckerConfig {
    /// Capture memory page by page into a shared page store instead of full copies.
    pub sparse_checkpoint: bool,

    /// Use the kernel's soft-dirty bits to only read pages modified since the previous snapshot.
    pub soft_dirty: bool,

    /// Compute a content hash for every snapshot and use it to filter comparisons.
    pub hash: bool,

    /// The maximum number of entries kept in the visited-state store, 0 disables the store.
    pub max_visited_states: usize,

    /// Whether open file descriptors are part of a snapshot.
    pub snapshot_fds: bool,

    /// The maximum number of distinct pages in the page store.
    pub max_pages: usize,

    /// The name of the shared object whose data segment is captured alongside the binary.
    pub library_name: Option<String>,

    /// Whether the stacks of every task are unwound when taking a snapshot.
    pub unwind_stacks: bool,

    /// The maximum number of steps of a single execution.
    pub max_depth: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            sparse_checkpoint: false,
            soft_dirty: false,
            hash: false,
            max_visited_states: 0,
            snapshot_fds: false,
            max_pages: mcheck_mem::MAX_PAGES,
            library_name: None,
            unwind_stacks: false,
            max_depth: 1000,
        }
    }
}

impl CheckerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load the configuration from variables provided by `get`.
    ///
    /// Boolean options are enabled by the presence of their variable.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let get_u64 = |name: &str| -> anyhow::Result<Option<u64>> {
            match get(name) {
                Some(value) => Ok(Some(
                    parse_u64_with_prefix(&value)
                        .with_context(|| format!("error parsing `{name}`: {value:?}"))?,
                )),
                None => Ok(None),
            }
        };

        let sparse_checkpoint = get("MCHECK_SPARSE_CHECKPOINT").is_some();
        let soft_dirty = get("MCHECK_SOFT_DIRTY").is_some();
        anyhow::ensure!(
            !soft_dirty || sparse_checkpoint,
            "MCHECK_SOFT_DIRTY requires MCHECK_SPARSE_CHECKPOINT"
        );

        let max_visited_states =
            get_u64("MCHECK_MAX_VISITED_STATES")?.map_or(0, |x| x as usize);

        let max_pages = get_u64("MCHECK_MAX_PAGES")?.map_or(defaults.max_pages, |x| x as usize);
        anyhow::ensure!(max_pages > 0, "`MCHECK_MAX_PAGES` must not be zero");

        Ok(Self {
            sparse_checkpoint,
            soft_dirty,
            hash: get("MCHECK_HASH").is_some(),
            max_visited_states,
            snapshot_fds: get("MCHECK_SNAPSHOT_FDS").is_some(),
            max_pages,
            library_name: get("MCHECK_LIBRARY").filter(|x| !x.is_empty()),
            unwind_stacks: get("MCHECK_UNWIND_STACKS").is_some() || max_visited_states > 0,
            max_depth: get_u64("MCHECK_MAX_DEPTH")?.unwrap_or(defaults.max_depth),
        })
    }
}

pub fn parse_u64_with_prefix(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(binary) = value.strip_prefix("0b") {
        u64::from_str_radix(binary, 2).ok()
    } else {
        value.parse().ok()
    }
}
