//! Pruner state machine.
//!
//! A [`Pruner`] destroys snapshots a retention policy no longer needs,
//! on one side of a replication setup. It drives
//! `Plan -> Exec -> Done` with wait states for transient failures:
//!
//! ```text
//!           retryable err                  retryable err
//!   ┌──────────────────► PlanWait   ┌──────────────────► ExecWait
//!   │                       │       │                       │
//! Plan ◄────────────────────┘     Exec ◄───────────────────┘
//!   │        timer                  │ │      timer
//!   └───────────────► Exec ─────────┘ └────► Done
//!
//!   any permanent error / cancellation ────► ErrPerm
//! ```
//!
//! Plan lists the target's filesystems and versions and asks the history
//! side for each snapshot's replication status; Exec runs the retention
//! rules per filesystem and issues destroys, one filesystem at a time (at
//! most one in-flight destroy per filesystem). Mutable state lives behind
//! one lock, mutated only through the [`Pruner::update`] helper; nothing
//! blocks while holding it.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::config::{rules_from_config, PruningPairConfig};
use crate::error::{Result, SnapferryError};
use crate::logging;
use crate::pdu::{
    DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, FilesystemVersion, ReplicationStatus,
    SnapshotReplicationStatusOp, SnapshotReplicationStatusReq, SnapshotReplicationStatusRes,
    VersionType,
};
use crate::pruning::{prune_snapshots, KeepRule, PruneSnapshot};

/// The side whose snapshots are pruned: listing, version enumeration and
/// destruction.
#[async_trait]
pub trait Target: Send + Sync {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>>;
    async fn list_filesystem_versions(&self, filesystem: &str) -> Result<Vec<FilesystemVersion>>;
    async fn destroy_snapshots(&self, req: &DestroySnapshotsReq) -> Result<DestroySnapshotsRes>;
}

/// The side that knows which snapshots have been replicated.
#[async_trait]
pub trait History: Send + Sync {
    async fn snapshot_replication_status(
        &self,
        req: &SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes>;
}

/// Pruner driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Plan,
    PlanWait,
    Exec,
    ExecWait,
    /// Terminal: a permanent error or cancellation stopped the run.
    ErrPerm,
    /// Terminal: all filesystems processed.
    Done,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::ErrPerm | State::Done)
    }
}

/// Per-filesystem prune record. A record sits in exactly one of the
/// pending or completed lists; a record completed with an error was never
/// executed.
#[derive(Debug, Clone)]
struct FsPruneRecord {
    path: String,
    snaps: Vec<PruneSnapshot>,
    err: Option<String>,
}

struct Args<T, H> {
    cancel: CancellationToken,
    target: T,
    receiver: H,
    rules: Vec<KeepRule>,
    retry_wait: Duration,
    side: &'static str,
}

struct Shared {
    state: State,
    sleep_until: Option<Instant>,
    err: Option<String>,
    prune_pending: Vec<FsPruneRecord>,
    prune_completed: Vec<FsPruneRecord>,
}

/// Snapshot of one filesystem's record for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemReport {
    pub filesystem: String,
    pub snapshot_count: usize,
    pub error: Option<String>,
}

/// Snapshot of the pruner's state for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunerReport {
    pub state: State,
    /// Most recent error, transient or permanent.
    pub error: Option<String>,
    /// End of the current retry wait, if the pruner is in a wait state.
    pub sleep_until: Option<Instant>,
    pub pending: Vec<FilesystemReport>,
    pub completed: Vec<FilesystemReport>,
}

/// Single-shot pruning driver. [`Pruner::prune`] runs to a terminal
/// state; progress and outcome are observable through
/// [`Pruner::report`].
pub struct Pruner<T, H> {
    args: Args<T, H>,
    sp: RwLock<Shared>,
}

impl<T: Target, H: History> Pruner<T, H> {
    fn new(args: Args<T, H>) -> Self {
        Self {
            args,
            sp: RwLock::new(Shared {
                state: State::Plan,
                sleep_until: None,
                err: None,
                prune_pending: Vec::new(),
                prune_completed: Vec::new(),
            }),
        }
    }

    /// Run the state machine to a terminal state.
    pub async fn prune(&self) {
        let span = logging::pruner_span(self.args.side);
        self.drive().instrument(span).await
    }

    /// Observe current state, error and both record lists.
    pub fn report(&self) -> PrunerReport {
        let sp = self.sp.read().expect("pruner lock poisoned");
        let as_report = |records: &[FsPruneRecord]| {
            records
                .iter()
                .map(|r| FilesystemReport {
                    filesystem: r.path.clone(),
                    snapshot_count: r.snaps.len(),
                    error: r.err.clone(),
                })
                .collect()
        };
        PrunerReport {
            state: sp.state,
            error: sp.err.clone(),
            sleep_until: sp.sleep_until,
            pending: as_report(&sp.prune_pending),
            completed: as_report(&sp.prune_completed),
        }
    }

    async fn drive(&self) {
        loop {
            let pre = self.state();
            if pre.is_terminal() {
                return;
            }
            match pre {
                State::Plan => self.state_plan().await,
                State::PlanWait => self.state_wait(State::Plan).await,
                State::Exec => self.state_exec().await,
                State::ExecWait => self.state_wait(State::Exec).await,
                State::ErrPerm | State::Done => unreachable!(),
            }
            let post = self.state();
            debug!(from = ?pre, to = ?post, "state transition");
        }
    }

    /// Mutate shared state under the lock and return the resulting state.
    /// The one and only way state is modified.
    fn update(&self, f: impl FnOnce(&mut Shared)) -> State {
        let mut sp = self.sp.write().expect("pruner lock poisoned");
        f(&mut sp);
        sp.state
    }

    fn state(&self) -> State {
        self.sp.read().expect("pruner lock poisoned").state
    }

    /// Record an error: wait-and-retry for transient failures, `ErrPerm`
    /// for everything else.
    fn on_err(&self, err: &SnapferryError) {
        self.update(|sp| {
            sp.err = Some(err.to_string());
            if !err.should_retry() {
                sp.state = State::ErrPerm;
                return;
            }
            sp.state = match sp.state {
                State::Plan => State::PlanWait,
                State::Exec => State::ExecWait,
                other => unreachable!("retryable error in state {:?}", other),
            };
        });
    }

    async fn state_plan(&self) {
        match self.plan_filesystems().await {
            Err(e) => self.on_err(&e),
            Ok(records) => {
                self.update(|sp| {
                    for record in records {
                        if record.err.is_some() {
                            sp.prune_completed.push(record);
                        } else {
                            sp.prune_pending.push(record);
                        }
                    }
                    sp.state = State::Exec;
                });
            }
        }
    }

    /// Build one record per target filesystem. Retryable failures abort
    /// the whole plan (the caller waits and replans); a permanent failure
    /// confined to one filesystem marks that record and lets the rest
    /// proceed.
    async fn plan_filesystems(&self) -> Result<Vec<FsPruneRecord>> {
        if self.args.cancel.is_cancelled() {
            return Err(SnapferryError::Cancelled);
        }
        let tfss = self.args.target.list_filesystems().await?;
        let mut records = Vec::with_capacity(tfss.len());
        for tfs in &tfss {
            if self.args.cancel.is_cancelled() {
                return Err(SnapferryError::Cancelled);
            }
            let tfsvs = self.args.target.list_filesystem_versions(&tfs.path).await?;
            let mut record = FsPruneRecord {
                path: tfs.path.clone(),
                snaps: Vec::with_capacity(tfsvs.len()),
                err: None,
            };
            for tfsv in tfsvs {
                if tfsv.kind != VersionType::Snapshot {
                    continue;
                }
                let creation = match tfsv.creation_time() {
                    Ok(creation) => creation,
                    Err(e) => {
                        warn!(
                            filesystem = %tfs.path,
                            version = %tfsv.rel_name(),
                            error = %e,
                            "invalid creation date, completing filesystem with error"
                        );
                        record.err =
                            Some(format!("{}{}: {}", tfs.path, tfsv.rel_name(), e));
                        record.snaps.clear();
                        break;
                    }
                };
                let req = SnapshotReplicationStatusReq {
                    filesystem: tfs.path.clone(),
                    snapshot: tfsv.name.clone(),
                    op: SnapshotReplicationStatusOp::Get,
                };
                let res = match self.args.receiver.snapshot_replication_status(&req).await {
                    Ok(res) => res,
                    Err(e) => {
                        error!(
                            filesystem = %req.filesystem,
                            snapshot = %req.snapshot,
                            error = %e,
                            "cannot get snapshot replication status"
                        );
                        if e.should_retry() {
                            return Err(e);
                        }
                        record.err = Some(e.to_string());
                        record.snaps.clear();
                        break;
                    }
                };
                if res.status == ReplicationStatus::Nonexistent {
                    debug!(
                        snapshot = %tfsv.name,
                        "snapshot not known to history, assuming replicated"
                    );
                }
                record.snaps.push(PruneSnapshot {
                    replicated: res.status != ReplicationStatus::NotReplicated,
                    date: creation,
                    version: tfsv,
                });
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn state_exec(&self) {
        let mut head = None;
        let state = self.update(|sp| {
            if sp.prune_pending.is_empty() {
                sp.state = State::Done;
            } else {
                head = Some(sp.prune_pending[0].clone());
            }
        });
        let mut record = match head {
            Some(record) if state == State::Exec => record,
            _ => return,
        };

        debug!(rules = ?self.args.rules, filesystem = %record.path, "computing destroy list");
        let destroy_list: Vec<FilesystemVersion> =
            prune_snapshots(&record.snaps, &self.args.rules)
                .into_iter()
                .map(|s| s.version)
                .collect();
        for version in &destroy_list {
            debug!(
                filesystem = %record.path,
                destroy_snap = %version.name,
                "policy destroys snapshot"
            );
        }
        let req = DestroySnapshotsReq {
            filesystem: record.path.clone(),
            snapshots: destroy_list,
        };
        if self.args.cancel.is_cancelled() {
            self.on_err(&SnapferryError::Cancelled);
            return;
        }
        record.err = match self.args.target.destroy_snapshots(&req).await {
            Ok(res) => {
                for destroyed in &res.results {
                    if !destroyed.error.is_empty() {
                        warn!(
                            filesystem = %record.path,
                            snapshot = %destroyed.snapshot.name,
                            error = %destroyed.error,
                            "destroy failed for snapshot"
                        );
                    }
                }
                None
            }
            Err(e) if e.should_retry() => {
                let msg = e.to_string();
                self.update(|sp| {
                    if let Some(pending) = sp.prune_pending.first_mut() {
                        pending.err = Some(msg.clone());
                    }
                });
                self.on_err(&e);
                return;
            }
            // not retryable: treat the record as done, with the error
            Err(e) => Some(e.to_string()),
        };

        self.update(|sp| {
            if !sp.prune_pending.is_empty() {
                sp.prune_pending.remove(0);
            }
            sp.prune_completed.push(record);
        });
    }

    async fn state_wait(&self, goback: State) {
        let retry_wait = self.args.retry_wait;
        self.update(|sp| sp.sleep_until = Some(Instant::now() + retry_wait));
        tokio::select! {
            _ = tokio::time::sleep(retry_wait) => {
                self.update(|sp| {
                    sp.sleep_until = None;
                    sp.state = goback;
                });
            }
            _ = self.args.cancel.cancelled() => {
                self.on_err(&SnapferryError::Cancelled);
            }
        }
    }
}

/// Fixed wait between retries of a transiently failed Plan or Exec.
const RETRY_WAIT: Duration = Duration::from_secs(10);

/// Builds sender- and receiver-side pruners that share validated rule
/// sets. Both sides run the same state machine; only the wiring of
/// target and history differs.
#[derive(Debug)]
pub struct PrunerFactory {
    sender_rules: Vec<KeepRule>,
    receiver_rules: Vec<KeepRule>,
    retry_wait: Duration,
}

/// The sender must never destroy its most recent snapshot, or there is
/// nothing left to replicate incrementally from. A non-empty sender rule
/// set therefore must contain a last-n rule; an empty set keeps all.
fn check_contains_keep_last_n(rules: &[KeepRule]) -> Result<()> {
    if rules.is_empty() {
        return Ok(());
    }
    if rules
        .iter()
        .any(|r| matches!(r, KeepRule::KeepLastN { .. }))
    {
        return Ok(());
    }
    Err(SnapferryError::Config(
        "sender keep rules must contain a last_n rule or be empty \
         so that the most recent snapshot is kept"
            .to_string(),
    ))
}

impl PrunerFactory {
    /// Build a factory from already-compiled rule sets.
    pub fn new(sender_rules: Vec<KeepRule>, receiver_rules: Vec<KeepRule>) -> Result<Self> {
        check_contains_keep_last_n(&sender_rules)?;
        Ok(Self {
            sender_rules,
            receiver_rules,
            retry_wait: RETRY_WAIT,
        })
    }

    /// Build a factory from configuration.
    pub fn from_config(config: &PruningPairConfig) -> Result<Self> {
        let receiver_rules = rules_from_config(&config.keep_receiver).map_err(|e| {
            SnapferryError::Config(format!("cannot build receiver pruning rules: {}", e))
        })?;
        let sender_rules = rules_from_config(&config.keep_sender).map_err(|e| {
            SnapferryError::Config(format!("cannot build sender pruning rules: {}", e))
        })?;
        check_contains_keep_last_n(&sender_rules)?;
        Ok(Self {
            sender_rules,
            receiver_rules,
            retry_wait: RETRY_WAIT,
        })
    }

    /// Pruner for the sending side: local target, remote history.
    pub fn build_sender_pruner<T: Target, H: History>(
        &self,
        cancel: CancellationToken,
        target: T,
        receiver: H,
    ) -> Pruner<T, H> {
        Pruner::new(Args {
            cancel,
            target,
            receiver,
            rules: self.sender_rules.clone(),
            retry_wait: self.retry_wait,
            side: "sender",
        })
    }

    /// Pruner for the receiving side: remote target, local history.
    pub fn build_receiver_pruner<T: Target, H: History>(
        &self,
        cancel: CancellationToken,
        target: T,
        receiver: H,
    ) -> Pruner<T, H> {
        Pruner::new(Args {
            cancel,
            target,
            receiver,
            rules: self.receiver_rules.clone(),
            retry_wait: self.retry_wait,
            side: "receiver",
        })
    }
}
