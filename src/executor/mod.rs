//! Commit executor
//!
//! [`CommitExecutor`] owns a [`CommitMachine`] and runs the commands it
//! emits: permission lookups, preparations and ledger submissions each run
//! in their own task and report back as events. Callers talk to it through a
//! cloneable [`CommitHandle`] and observe it through published
//! [`CommitSnapshot`]s.
//!
//! ```ignore
//! let handle = CommitExecutor::spawn(ledger, store, CommitCallbacks::new());
//! handle.set_request(CommitRequest::new(payload).resource(widget).account(account)).await?;
//! let snapshot = handle.wait_for(|s| !s.state.is_busy()).await?;
//! if snapshot.needs_decision() {
//!     handle.confirm(DepositTier::None, snapshot.delegate_future).await?;
//! }
//! ```

mod machine;

pub use machine::{
    CommitCommand, CommitEvent, CommitMachine, CommitSnapshot, CommitState, Confirmation,
    PermissionUpdate, Submission, SubmitPath,
};

use crate::cache::{CacheStore, PermissionCache};
use crate::deposit::{DepositCalculator, DepositTier};
use crate::error::{CommitError, Result};
use crate::ledger::LedgerClient;
use crate::prepare::{build_commit, CommitPreparer, CommitRequest};
use serde_json::Value;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the caller instruction queue
const CALL_QUEUE_SIZE: usize = 32;

type CommitCallback = Box<dyn Fn(&Value) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&CommitError) + Send + Sync>;

/// Hooks invoked when a submission settles
#[derive(Default)]
pub struct CommitCallbacks {
    on_commit: Option<CommitCallback>,
    on_error: Option<ErrorCallback>,
}

impl CommitCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the written diff after every successful submission
    pub fn on_commit(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_commit = Some(Box::new(f));
        self
    }

    /// Called when preparation or submission fails
    pub fn on_error(mut self, f: impl Fn(&CommitError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn committed(&self, diff: &Value) {
        if let Some(f) = &self.on_commit {
            guarded("on_commit", || f(diff));
        }
    }

    fn failed(&self, error: &CommitError) {
        if let Some(f) = &self.on_error {
            guarded("on_error", || f(error));
        }
    }
}

/// Run a caller hook so that a panic inside it is logged instead of
/// unwinding through the driver task
fn guarded(hook: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(hook, panic = %message, "Commit callback panicked");
    }
}

enum Instruction {
    SetRequest(CommitRequest),
    Confirm(Confirmation),
    Cancel,
    Retry,
}

impl Instruction {
    fn into_event(self) -> CommitEvent {
        match self {
            Instruction::SetRequest(request) => CommitEvent::RequestChanged(request),
            Instruction::Confirm(confirmation) => CommitEvent::Confirmed(confirmation),
            Instruction::Cancel => CommitEvent::Cancel,
            Instruction::Retry => CommitEvent::Retry,
        }
    }
}

struct Call {
    instruction: Instruction,
    reply: oneshot::Sender<Result<()>>,
}

/// Caller side of a running executor
#[derive(Clone)]
pub struct CommitHandle {
    calls: mpsc::Sender<Call>,
    snapshot: watch::Receiver<CommitSnapshot>,
}

impl CommitHandle {
    /// Stage a new request, starting a negotiation
    pub async fn set_request(&self, request: CommitRequest) -> Result<()> {
        self.call(Instruction::SetRequest(request)).await
    }

    /// Confirm the prepared commit
    pub async fn confirm(&self, extra_tier: DepositTier, delegate_future: bool) -> Result<()> {
        self.call(Instruction::Confirm(Confirmation {
            extra_tier,
            delegate_future,
        }))
        .await
    }

    /// Drop the current negotiation; a submitted write still completes
    pub async fn cancel(&self) -> Result<()> {
        self.call(Instruction::Cancel).await
    }

    /// Prepare the last request again
    pub async fn retry(&self) -> Result<()> {
        self.call(Instruction::Retry).await
    }

    /// Latest published state
    pub fn snapshot(&self) -> CommitSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CommitSnapshot) -> bool,
    ) -> Result<CommitSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| CommitError::Stopped)?;
        Ok(snapshot.clone())
    }

    async fn call(&self, instruction: Instruction) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(Call { instruction, reply })
            .await
            .map_err(|_| CommitError::Stopped)?;
        response.await.map_err(|_| CommitError::Stopped)?
    }
}

/// Drives one commit negotiation over a ledger and a shared cache store
pub struct CommitExecutor<L, C>
where
    L: LedgerClient + 'static,
    C: CacheStore + 'static,
{
    machine: CommitMachine,
    preparer: CommitPreparer,
    ledger: Arc<L>,
    permissions: PermissionCache<C>,
    callbacks: CommitCallbacks,
    events: mpsc::UnboundedSender<CommitEvent>,
    pending: usize,
    snapshot: watch::Sender<CommitSnapshot>,
}

impl<L, C> CommitExecutor<L, C>
where
    L: LedgerClient + 'static,
    C: CacheStore + 'static,
{
    /// Start an executor on the current runtime
    pub fn spawn(ledger: Arc<L>, store: Arc<C>, callbacks: CommitCallbacks) -> CommitHandle {
        let machine = CommitMachine::new(DepositCalculator::new(ledger.cost_per_byte()));
        let (snapshot, snapshot_rx) = watch::channel(machine.snapshot());
        let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let executor = Self {
            machine,
            preparer: CommitPreparer::new(),
            ledger,
            permissions: PermissionCache::new(store),
            callbacks,
            events: events_tx,
            pending: 0,
            snapshot,
        };
        tokio::spawn(executor.run(calls_rx, events_rx));

        CommitHandle {
            calls: calls_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Process calls and task completions until every handle is gone and
    /// no task is outstanding
    async fn run(
        mut self,
        mut calls: mpsc::Receiver<Call>,
        mut events: mpsc::UnboundedReceiver<CommitEvent>,
    ) {
        let mut accepting = true;
        loop {
            if !accepting && self.pending == 0 {
                break;
            }
            tokio::select! {
                call = calls.recv(), if accepting => match call {
                    Some(Call { instruction, reply }) => {
                        let result = self.apply(instruction.into_event());
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!(pending = self.pending, "All commit handles dropped");
                        accepting = false;
                    }
                },
                Some(event) = events.recv() => {
                    self.pending = self.pending.saturating_sub(1);
                    if let Err(e) = self.apply(event) {
                        warn!(error = %e, "Task completion refused");
                    }
                }
            }
        }
        debug!("Commit executor stopped");
    }

    fn apply(&mut self, event: CommitEvent) -> Result<()> {
        let commands = self.machine.handle(event)?;
        for command in commands {
            self.execute(command);
        }
        self.snapshot.send_replace(self.machine.snapshot());
        Ok(())
    }

    fn execute(&mut self, command: CommitCommand) {
        match command {
            CommitCommand::LoadPermission(ticket) => {
                let permissions = self.permissions.clone();
                self.spawn_task(async move {
                    let permission = permissions.get(&ticket.key).await;
                    CommitEvent::PermissionLoaded { ticket, permission }
                });
            }
            CommitCommand::Prepare { generation, request } => {
                if !self.preparer.begin(&request) {
                    self.spawn_task(async move {
                        CommitEvent::Prepared {
                            generation,
                            outcome: Ok(None),
                        }
                    });
                    return;
                }
                let ledger = Arc::clone(&self.ledger);
                self.spawn_task(async move {
                    let outcome = build_commit(ledger.as_ref(), &request).await.map(Some);
                    CommitEvent::Prepared { generation, outcome }
                });
            }
            CommitCommand::Submit(submission) => {
                let ledger = Arc::clone(&self.ledger);
                let permissions = self.permissions.clone();
                self.spawn_task(async move {
                    let id = submission.id;
                    let outcome = submit(ledger.as_ref(), &permissions, submission).await;
                    CommitEvent::Settled {
                        submission: id,
                        outcome,
                    }
                });
            }
            CommitCommand::NotifyCommitted { diff } => self.callbacks.committed(&diff),
            CommitCommand::NotifyFailed { error } => self.callbacks.failed(&error),
            CommitCommand::ResetPreparer => self.preparer.reset(),
        }
    }

    fn spawn_task<F>(&mut self, task: F)
    where
        F: Future<Output = CommitEvent> + Send + 'static,
    {
        self.pending += 1;
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(task.await);
        });
    }
}

/// Hand `submission` to the ledger; on success persist the new permission
/// and drop cache entries the write superseded
async fn submit<L, C>(ledger: &L, permissions: &PermissionCache<C>, submission: Submission) -> Result<()>
where
    L: LedgerClient + ?Sized,
    C: CacheStore,
{
    let Submission {
        id,
        account_id,
        path,
        payload,
        deposit,
        permission_update,
    } = submission;

    match path {
        SubmitPath::Write => ledger.submit_write(&account_id, &payload, deposit).await?,
        SubmitPath::WriteWithGrant => {
            ledger
                .submit_write_with_grant(&account_id, &payload, deposit)
                .await?
        }
    }

    if let Some(update) = permission_update {
        if let Err(e) = permissions.set(&update.key, &update.permission).await {
            warn!(submission = id, key = %update.key, error = %e, "Failed to persist write permission");
        }
    }
    match permissions.invalidate(&payload).await {
        Ok(removed) => info!(submission = id, removed, "Invalidated cache entries"),
        Err(e) => warn!(submission = id, error = %e, "Cache invalidation failed"),
    }
    Ok(())
}
