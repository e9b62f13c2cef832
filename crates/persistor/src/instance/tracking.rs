//! Dirty/version lifecycle of an instance.
//!
//! ```text
//! Clean --set_dirty--> Dirty --write phase--> Saving --commit--> Clean (version + 1)
//!                        ^                      |
//!                        +--- conflict (stale) -+
//!
//! A rollback restores whatever state each instance had before the write phase.
//! ```

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Matches what was last read or written.
    Clean,
    /// Registered with a transaction, not yet written.
    Dirty,
    /// Being written by a transaction's write phase.
    Saving,
    /// Its row/document has been removed; the handle must be discarded.
    Deleted,
}

/// Version counter, state and staleness flag of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracking {
    state: InstanceState,
    version: i64,
    stale: bool,
}

impl Tracking {
    /// A new instance that has never been stored.
    pub fn unsaved() -> Self {
        Self {
            state: InstanceState::Clean,
            version: 0,
            stale: false,
        }
    }

    /// An instance materialized from a stored row at `version`.
    pub fn loaded(version: i64) -> Self {
        Self {
            state: InstanceState::Clean,
            version,
            stale: false,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Set when a write lost a version check; cleared by refresh or a later save.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, InstanceState::Dirty | InstanceState::Saving)
    }

    pub fn mark_dirty(&mut self) {
        if self.state != InstanceState::Deleted {
            self.state = InstanceState::Dirty;
        }
    }

    pub(crate) fn begin_save(&mut self) {
        self.state = InstanceState::Saving;
    }

    /// A successful write: exactly one version increment.
    pub(crate) fn commit_save(&mut self) {
        self.version += 1;
        self.state = InstanceState::Clean;
        self.stale = false;
    }

    /// The instance's write lost the version check.
    pub(crate) fn conflict(&mut self) {
        self.state = InstanceState::Dirty;
        self.stale = true;
    }

    pub(crate) fn refreshed(&mut self, version: i64) {
        self.version = version;
        self.state = InstanceState::Clean;
        self.stale = false;
    }

    pub(crate) fn deleted(&mut self) {
        self.state = InstanceState::Deleted;
    }
}
