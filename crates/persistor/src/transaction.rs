//! Transactions and the manager that ends them.
//!
//! A [`Transaction`] collects intent: instances marked dirty, instances to
//! delete, and optional pre/post-save hooks. Nothing touches storage until
//! [`TransactionManager::end`], which runs the whole write phase inside one
//! backend transaction:
//!
//! 1. run the pre-save hook, which may register more work;
//! 2. expand and order the save set, then write it;
//! 3. on a version conflict roll back, mark the loser stale and fail with
//!    "Update Conflict";
//! 4. on a backend deadlock roll back and retry the whole phase, up to
//!    `max_deadlock_retries` times with linear backoff;
//! 5. on commit, apply new identities and versions to the graph and run the
//!    post-save hook.
//!
//! # Example
//!
//! ```ignore
//! let mut txn = persistor.begin(TransactionOptions::default()).await?;
//! txn.set_dirty(&mut graph, account)?;
//! txn.set_dirty(&mut graph, debit)?;
//! let report = persistor.end(&mut txn, &mut graph).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::PersistorConfig;
use crate::core::{Backend, Connection};
use crate::error::{BackendError, ConcurrencyError, StorageError, StorageResult, TransactionError};
use crate::instance::{InstanceId, ObjectGraph, Tracking};
use crate::mapper::write::{self, WriteFailure, WriteOutcome};

/// Options for starting a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Borrow a pooled connection only for the write phase instead of
    /// holding a dedicated one from `begin` to `end`.
    pub share_connection: bool,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share_connection(mut self) -> Self {
        self.share_connection = true;
        self
    }
}

/// Lifecycle of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Saving,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Saving => write!(f, "saving"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled-back"),
        }
    }
}

/// What a committed transaction wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub transaction_id: Uuid,
    /// Instances written, parents before children.
    pub saved: Vec<InstanceId>,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: Vec<InstanceId>,
    /// Rows removed because they left a pruning relationship.
    pub pruned: usize,
    /// Write-phase attempts, 1 unless a deadlock forced a retry.
    pub attempts: u32,
    pub committed_at: DateTime<Utc>,
}

/// Dirty and delete registrations, in registration order.
#[derive(Debug, Default)]
struct PendingWrites {
    dirty: Vec<InstanceId>,
    deletes: Vec<InstanceId>,
}

impl PendingWrites {
    fn mark_dirty(&mut self, graph: &mut ObjectGraph, id: InstanceId) -> StorageResult<()> {
        let instance = graph.instance_mut(id)?;
        if instance.is_deleted() {
            return Err(crate::error::ValidationError::Deleted {
                template: instance.template().to_string(),
                id: instance.id().unwrap_or_default().to_string(),
            }
            .into());
        }
        instance.tracking.mark_dirty();
        if !self.dirty.contains(&id) {
            self.dirty.push(id);
        }
        Ok(())
    }

    fn mark_deleted(&mut self, graph: &ObjectGraph, id: InstanceId) -> StorageResult<()> {
        graph.instance(id)?;
        if !self.deletes.contains(&id) {
            self.deletes.push(id);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.deletes.is_empty()
    }
}

/// What a pre-save hook can see and change.
pub struct SaveScope<'a> {
    graph: &'a mut ObjectGraph,
    pending: &'a mut PendingWrites,
}

impl SaveScope<'_> {
    pub fn graph(&self) -> &ObjectGraph {
        self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        self.graph
    }

    /// Instances registered so far.
    pub fn dirty(&self) -> &[InstanceId] {
        &self.pending.dirty
    }

    pub fn set_dirty(&mut self, id: InstanceId) -> StorageResult<()> {
        self.pending.mark_dirty(self.graph, id)
    }

    pub fn delete(&mut self, id: InstanceId) -> StorageResult<()> {
        self.pending.mark_deleted(self.graph, id)
    }
}

pub type PreSaveHook = Box<dyn FnMut(&mut SaveScope<'_>) -> StorageResult<()> + Send>;
pub type PostSaveHook = Box<dyn FnMut(&SaveReport) + Send>;

/// A unit of work.
///
/// Obtained from `Persistor::begin` / [`TransactionManager::begin`] and
/// finished with `end`. A handle that has been ended, successfully or not,
/// rejects further use with [`TransactionError::InvalidTransaction`].
pub struct Transaction {
    id: Uuid,
    state: TransactionState,
    options: TransactionOptions,
    pending: PendingWrites,
    connection: Option<Box<dyn Connection>>,
    pre_save: Option<PreSaveHook>,
    post_save: Option<PostSaveHook>,
    inner_error: Option<BackendError>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("pending", &self.pending)
            .field("dedicated_connection", &self.connection.is_some())
            .field("inner_error", &self.inner_error)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(options: TransactionOptions, connection: Option<Box<dyn Connection>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TransactionState::Open,
            options,
            pending: PendingWrites::default(),
            connection,
            pre_save: None,
            post_save: None,
            inner_error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    /// The last deadlock reported during `end`, kept even when a later
    /// attempt failed for another reason.
    pub fn inner_error(&self) -> Option<&BackendError> {
        self.inner_error.as_ref()
    }

    /// Instances registered dirty, in registration order.
    pub fn dirty(&self) -> &[InstanceId] {
        &self.pending.dirty
    }

    pub fn deletes(&self) -> &[InstanceId] {
        &self.pending.deletes
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransactionError::InvalidTransaction.into())
        }
    }

    /// Registers an instance for writing. Idempotent.
    pub fn set_dirty(&mut self, graph: &mut ObjectGraph, id: InstanceId) -> StorageResult<()> {
        self.ensure_open()?;
        self.pending.mark_dirty(graph, id)
    }

    /// Registers an instance for deletion at `end`.
    pub fn delete(&mut self, graph: &ObjectGraph, id: InstanceId) -> StorageResult<()> {
        self.ensure_open()?;
        self.pending.mark_deleted(graph, id)
    }

    /// Marks `id` dirty together with everything reachable from it through
    /// the resolved relationships of templates declared `cascadeSave`.
    pub fn cascade_save(&mut self, graph: &mut ObjectGraph, id: InstanceId) -> StorageResult<()> {
        self.ensure_open()?;
        let registry = Arc::clone(graph.registry());
        let mut stack = vec![id];
        let mut seen = std::collections::HashSet::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            self.pending.mark_dirty(graph, current)?;

            let instance = graph.instance(current)?;
            let schema = registry.template(instance.template())?;
            if !schema.cascade_save() {
                continue;
            }
            for property in schema.relationships() {
                if !instance.is_fetched(&property.name) {
                    continue;
                }
                stack.extend(graph.reference(current, &property.name));
                stack.extend(graph.collection(current, &property.name).iter().rev().copied());
            }
        }
        Ok(())
    }

    /// Installs a hook run at the start of `end`, before anything is written.
    ///
    /// An error from the hook aborts `end`; nothing is written.
    pub fn on_pre_save(
        &mut self,
        hook: impl FnMut(&mut SaveScope<'_>) -> StorageResult<()> + Send + 'static,
    ) {
        self.pre_save = Some(Box::new(hook));
    }

    /// Installs a hook run after a successful commit.
    pub fn on_post_save(&mut self, hook: impl FnMut(&SaveReport) + Send + 'static) {
        self.post_save = Some(Box::new(hook));
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() && !self.pending.is_empty() {
            tracing::warn!(
                transaction = %self.id,
                dirty = self.pending.dirty.len(),
                deletes = self.pending.deletes.len(),
                "Transaction dropped without end, pending writes discarded"
            );
        }
    }
}

fn restore(graph: &mut ObjectGraph, snapshot: &[(InstanceId, Tracking)]) {
    for (id, tracking) in snapshot {
        if let Ok(instance) = graph.instance_mut(*id) {
            instance.tracking = tracking.clone();
        }
    }
}

/// Runs write phases against one backend.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    backend: Arc<dyn Backend>,
    config: PersistorConfig,
}

impl TransactionManager {
    pub fn new(backend: Arc<dyn Backend>, config: PersistorConfig) -> Self {
        Self { backend, config }
    }

    /// Opens a transaction handle.
    ///
    /// Unless `share_connection` is set, a dedicated connection is taken
    /// from the pool now and held until `end`. Single-connection backends
    /// always share.
    pub async fn begin(&self, options: TransactionOptions) -> StorageResult<Transaction> {
        let options = TransactionOptions {
            share_connection: options.share_connection || self.backend.is_single_connection(),
        };
        let connection = if options.share_connection {
            None
        } else {
            Some(self.backend.acquire().await?)
        };
        let txn = Transaction::new(options, connection);
        tracing::debug!(transaction = %txn.id, shared = options.share_connection, "Transaction begun");
        Ok(txn)
    }

    /// Writes everything registered on `txn` atomically.
    pub async fn end(&self, txn: &mut Transaction, graph: &mut ObjectGraph) -> StorageResult<SaveReport> {
        txn.ensure_open()?;

        if let Some(hook) = txn.pre_save.as_mut() {
            let mut scope = SaveScope {
                graph: &mut *graph,
                pending: &mut txn.pending,
            };
            if let Err(e) = hook(&mut scope) {
                tracing::warn!(transaction = %txn.id, error = %e, "Pre-save hook failed");
                self.finish(txn, TransactionState::RolledBack);
                return Err(TransactionError::HookFailed {
                    stage: "preSave".to_string(),
                    message: e.to_string(),
                }
                .into());
            }
        }

        txn.state = TransactionState::Saving;
        let order = match write::save_set(graph, &txn.pending.dirty, &txn.pending.deletes)
            .and_then(|set| write::write_order(graph, &set))
        {
            Ok(order) => order,
            Err(e) => {
                self.finish(txn, TransactionState::RolledBack);
                return Err(e);
            }
        };
        let snapshot: Vec<(InstanceId, Tracking)> = order
            .iter()
            .filter_map(|id| graph.instance(*id).ok().map(|i| (*id, i.tracking.clone())))
            .collect();

        let mut conn = match txn.connection.take() {
            Some(conn) => conn,
            None => match self.backend.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.finish(txn, TransactionState::RolledBack);
                    return Err(e.into());
                }
            },
        };

        let mut attempts = 0u32;
        let result: StorageResult<WriteOutcome> = loop {
            attempts += 1;
            for id in &order {
                if let Ok(instance) = graph.instance_mut(*id) {
                    instance.tracking.begin_save();
                }
            }

            let failure = match self.attempt(conn.as_mut(), graph, &order, &txn.pending.deletes).await {
                Ok(outcome) => break Ok(outcome),
                Err(failure) => failure,
            };
            restore(graph, &snapshot);

            if let StorageError::Backend(err) = &failure.error
                && err.is_deadlock()
            {
                txn.inner_error = Some(err.clone());
                if attempts <= self.config.max_deadlock_retries {
                    let backoff = self.config.deadlock_backoff_ms * u64::from(attempts);
                    tracing::warn!(
                        transaction = %txn.id,
                        attempt = attempts,
                        backoff_ms = backoff,
                        error = %err,
                        "Deadlock during write phase, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
                break Err(ConcurrencyError::RetriesExhausted {
                    attempts,
                    inner: err.clone(),
                }
                .into());
            }

            if let Some(conflicted) = failure.conflicted
                && let Ok(instance) = graph.instance_mut(conflicted)
            {
                instance.tracking.conflict();
            }
            break Err(failure.error);
        };
        drop(conn);

        match result {
            Ok(outcome) => {
                outcome.apply(graph)?;
                let report = SaveReport {
                    transaction_id: txn.id,
                    saved: outcome.saved.clone(),
                    inserted: outcome.inserted,
                    updated: outcome.updated,
                    deleted: outcome.deleted.clone(),
                    pruned: outcome.pruned.len(),
                    attempts,
                    committed_at: Utc::now(),
                };
                self.finish(txn, TransactionState::Committed);
                tracing::info!(
                    transaction = %txn.id,
                    inserted = report.inserted,
                    updated = report.updated,
                    deleted = report.deleted.len(),
                    pruned = report.pruned,
                    attempts,
                    "Transaction committed"
                );
                if let Some(hook) = txn.post_save.as_mut() {
                    hook(&report);
                }
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(transaction = %txn.id, attempts, error = %e, "Transaction rolled back");
                self.finish(txn, TransactionState::RolledBack);
                Err(e)
            }
        }
    }

    /// One write phase inside one backend transaction.
    async fn attempt(
        &self,
        conn: &mut dyn Connection,
        graph: &ObjectGraph,
        order: &[InstanceId],
        deletes: &[InstanceId],
    ) -> Result<WriteOutcome, WriteFailure> {
        conn.begin().await?;
        match write::execute(graph, conn, order, deletes).await {
            Ok(outcome) => match conn.commit().await {
                Ok(()) => Ok(outcome),
                Err(e) => {
                    if let Err(rollback) = conn.rollback().await {
                        tracing::error!(error = %rollback, "Rollback after failed commit also failed");
                    }
                    Err(e.into())
                }
            },
            Err(failure) => {
                if let Err(rollback) = conn.rollback().await {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                Err(failure)
            }
        }
    }

    fn finish(&self, txn: &mut Transaction, state: TransactionState) {
        txn.state = state;
        txn.connection = None;
    }
}
