//! Store configuration knobs (§8, ambient stack).
//!
//! Shaped like the teacher's `StorageConfig`/`ServerConfig`
//! (`server-rust/src/storage/impls/default_record_store.rs`): a plain
//! `Default`-derived struct with builder-style `with_*` setters, supplied
//! once at construction and immutable afterwards -- there are no concurrent
//! readers to race, so no interior mutability is needed here.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether mutation entry points schedule a commit automatically on the
    /// `middle` queue (§4.2).
    pub auto_commit: bool,
    /// Whether a `DIRTY` record's server patch is rebased on top of the
    /// client's edits (§4.2, "Rebase policy") rather than discarded.
    pub rebase_conflicts: bool,
    /// Number of positions per `WindowedQuery` window (§4.5).
    pub window_size: usize,
    /// Extra windows kept loaded beyond the range any observer is currently
    /// watching, when `optimise_fetching` is enabled.
    pub prefetch_windows: usize,
    /// Whether `sourceWillFetchQuery` drops windows no longer intersected by
    /// any live range observer.
    pub optimise_fetching: bool,
    /// Maximum number of storeKeys considered per eviction sweep. `None`
    /// means unbounded (consider every eligible storeKey).
    pub eviction_batch_size: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            auto_commit: true,
            rebase_conflicts: true,
            window_size: 30,
            prefetch_windows: 1,
            optimise_fetching: false,
            eviction_batch_size: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    #[must_use]
    pub fn with_rebase_conflicts(mut self, rebase_conflicts: bool) -> Self {
        self.rebase_conflicts = rebase_conflicts;
        self
    }

    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    #[must_use]
    pub fn with_prefetch_windows(mut self, prefetch_windows: usize) -> Self {
        self.prefetch_windows = prefetch_windows;
        self
    }

    #[must_use]
    pub fn with_optimise_fetching(mut self, optimise_fetching: bool) -> Self {
        self.optimise_fetching = optimise_fetching;
        self
    }

    #[must_use]
    pub fn with_eviction_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.eviction_batch_size = batch_size;
        self
    }
}
